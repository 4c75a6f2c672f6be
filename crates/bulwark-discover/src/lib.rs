//! Container discovery: turns the runtime driver's flat container
//! list into the grouped `Target`/`Service` shape the planner consumes.
//! Compose-labeled containers fold into one target per project; anything
//! else becomes its own loose-container target. Management is opt-in via
//! `bulwark.enabled`, so most containers on a host are silently skipped.

use std::collections::BTreeMap;

use anyhow::Result;
use bulwark_labels::parse_labels;
use bulwark_retry::Cancellation;
use bulwark_runtime::{ContainerSummary, RuntimeDriver};
use bulwark_store::Store;
use bulwark_types::{Service, Target, TargetKind};

/// Runs discovery against the runtime driver and returns the grouped
/// targets, first-occurrence-wins on duplicate target/service ids.
pub fn discover(runtime: &dyn RuntimeDriver, cancel: &Cancellation) -> Result<Vec<Target>> {
    let containers = runtime.list_containers(false, cancel)?;
    Ok(group(&containers))
}

/// Runs discovery and reconciles the result into `store`, preserving
/// existing ids across path renames and pruning targets that are
/// no longer present. Returns the reconciled targets.
pub fn discover_and_sync(
    runtime: &dyn RuntimeDriver,
    store: &dyn Store,
    cancel: &Cancellation,
) -> Result<Vec<Target>> {
    let discovered = discover(runtime, cancel)?;
    let mut synced = Vec::with_capacity(discovered.len());
    let mut seen_ids = Vec::with_capacity(discovered.len());

    for target in &discovered {
        let mut stored_target = store.upsert_target(target)?;
        seen_ids.push(stored_target.id.clone());

        let mut services = Vec::with_capacity(target.services.len());
        for service in &target.services {
            let mut service = service.clone();
            service.target_id = stored_target.id.clone();
            services.push(store.upsert_service(&service)?);
        }
        stored_target.services = services;
        synced.push(stored_target);
    }

    store.prune_stale_targets(&seen_ids)?;
    Ok(synced)
}

fn group(containers: &[ContainerSummary]) -> Vec<Target> {
    let mut order: Vec<String> = Vec::new();
    let mut targets: BTreeMap<String, Target> = BTreeMap::new();

    for container in containers {
        let parsed = parse_labels(&container.image, &container.labels);
        if !parsed.labels.enabled {
            continue;
        }

        let (kind, name, path) = match (&container.compose_project, &container.compose_service) {
            (Some(project), Some(_)) => (
                TargetKind::Compose,
                project.clone(),
                container.compose_working_dir.clone().unwrap_or_default(),
            ),
            _ => {
                let short_id = &container.id[..container.id.len().min(12)];
                (TargetKind::Container, format!("container_{short_id}"), String::new())
            }
        };

        let target_id = Target::derive_id(kind, &name, &path);
        targets.entry(target_id.clone()).or_insert_with(|| {
            order.push(target_id.clone());
            Target {
                id: target_id.clone(),
                kind,
                name: name.clone(),
                path: path.clone(),
                labels: BTreeMap::new(),
                services: Vec::new(),
            }
        });

        let service_name = container
            .compose_service
            .clone()
            .unwrap_or_else(|| container.name.clone());
        let target = targets.get_mut(&target_id).expect("just inserted above");
        if target.services.iter().any(|s| s.name == service_name) {
            continue;
        }

        target.services.push(Service {
            id: Service::derive_id(&target_id, &service_name),
            target_id: target_id.clone(),
            name: service_name,
            image: container.image.clone(),
            current_digest: container.image_digest.clone(),
            labels: container.labels.clone(),
            health_check: None,
        });
    }

    order.into_iter().filter_map(|id| targets.remove(&id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_runtime::FakeRuntime;
    use bulwark_store::InMemoryStore;

    fn container(
        id: &str,
        name: &str,
        image: &str,
        enabled: bool,
        project: Option<&str>,
        service: Option<&str>,
        working_dir: Option<&str>,
    ) -> ContainerSummary {
        let mut labels = BTreeMap::new();
        if enabled {
            labels.insert("bulwark.enabled".to_string(), "true".to_string());
        }
        ContainerSummary {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            image_digest: "sha256:aaa".to_string(),
            labels,
            running: true,
            compose_project: project.map(str::to_string),
            compose_service: service.map(str::to_string),
            compose_working_dir: working_dir.map(str::to_string),
        }
    }

    #[test]
    fn disabled_containers_are_skipped() {
        let containers = vec![container("c1", "web", "nginx", false, None, None, None)];
        assert!(group(&containers).is_empty());
    }

    #[test]
    fn loose_container_becomes_its_own_target() {
        let containers = vec![container("c1234567890abcdef", "web", "nginx", true, None, None, None)];
        let targets = group(&containers);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, TargetKind::Container);
        assert_eq!(targets[0].name, "container_c1234567890a");
        assert_eq!(targets[0].services.len(), 1);
        assert_eq!(targets[0].services[0].name, "web");
    }

    #[test]
    fn compose_containers_group_under_one_target() {
        let containers = vec![
            container("c1", "app_web_1", "nginx", true, Some("app"), Some("web"), Some("/srv/app")),
            container("c2", "app_db_1", "postgres", true, Some("app"), Some("db"), Some("/srv/app")),
        ];
        let targets = group(&containers);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, TargetKind::Compose);
        assert_eq!(targets[0].name, "app");
        assert_eq!(targets[0].services.len(), 2);
    }

    #[test]
    fn duplicate_target_ids_keep_first_occurrence_services() {
        let containers = vec![
            container("c1", "app_web_1", "nginx:1.0", true, Some("app"), Some("web"), Some("/srv/app")),
            container("c2", "app_web_1", "nginx:2.0", true, Some("app"), Some("web"), Some("/srv/app")),
        ];
        let targets = group(&containers);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].services.len(), 1);
        assert_eq!(targets[0].services[0].image, "nginx:1.0");
    }

    #[test]
    fn discover_reads_from_runtime_driver() {
        let rt = FakeRuntime::new();
        rt.add_container(container("c1", "web", "nginx", true, None, None, None));
        let cancel = Cancellation::new();
        let targets = discover(rt.as_ref(), &cancel).unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn discover_and_sync_preserves_id_across_path_rename() {
        let store = InMemoryStore::new();
        let rt = FakeRuntime::new();
        rt.add_container(container(
            "c1",
            "app_web_1",
            "nginx",
            true,
            Some("app"),
            Some("web"),
            Some("/srv/app/docker-compose.yml"),
        ));
        let cancel = Cancellation::new();
        let first = discover_and_sync(rt.as_ref(), &store, &cancel).unwrap();
        let original_id = first[0].id.clone();

        let rt2 = FakeRuntime::new();
        rt2.add_container(container(
            "c1",
            "app_web_1",
            "nginx",
            true,
            Some("app"),
            Some("web"),
            Some("/srv/app/docker-compose.yaml"),
        ));
        let second = discover_and_sync(rt2.as_ref(), &store, &cancel).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, original_id);
    }

    #[test]
    fn discover_and_sync_prunes_targets_no_longer_seen() {
        let store = InMemoryStore::new();
        let rt = FakeRuntime::new();
        rt.add_container(container("c1", "web", "nginx", true, None, None, None));
        let cancel = Cancellation::new();
        discover_and_sync(rt.as_ref(), &store, &cancel).unwrap();
        assert_eq!(store.list_targets().unwrap().len(), 1);

        let empty_rt = FakeRuntime::new();
        discover_and_sync(empty_rt.as_ref(), &store, &cancel).unwrap();
        assert!(store.list_targets().unwrap().is_empty());
    }
}
