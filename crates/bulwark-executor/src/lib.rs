//! Applies one planned update end to end: acquire the per-target
//! lock, pull and recreate via compose, resolve the digest the container
//! actually came up with, probe it, and roll back on probe failure.
//! Every exit path returns an `UpdateResult`; the lock is released
//! by `LockGuard`'s `Drop` no matter which path was taken.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bulwark_config::{ProbeDefaults, Reporter};
use bulwark_labels::parse_labels;
use bulwark_lock::LockManager;
use bulwark_policy::should_rollback;
use bulwark_probe::{ProbeEngine, all_passed};
use bulwark_retry::Cancellation;
use bulwark_runtime::RuntimeDriver;
use bulwark_types::{Definition, ProbeConfig, Service, Target, TargetKind, UpdateResult};
use chrono::Utc;

pub struct Executor {
    runtime: Arc<dyn RuntimeDriver>,
    locks: LockManager,
    probes: ProbeEngine,
    lock_timeout: Duration,
    probe_defaults: ProbeDefaults,
    allow_self_update: bool,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn RuntimeDriver>,
        locks: LockManager,
        probes: ProbeEngine,
        lock_timeout: Duration,
        probe_defaults: ProbeDefaults,
        allow_self_update: bool,
    ) -> Self {
        Self {
            runtime,
            locks,
            probes,
            lock_timeout,
            probe_defaults,
            allow_self_update,
        }
    }

    /// Executes (or, in dry-run mode, simulates) one update. `expected_new_digest`
    /// is the remote digest the planner observed; it's used verbatim for
    /// dry runs and as a fallback if the post-recreate inspect can't
    /// produce a digest of its own.
    pub fn execute_update(
        &self,
        target: &Target,
        service: &Service,
        expected_new_digest: &str,
        dry_run: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> UpdateResult {
        let started_at = Utc::now();
        let mut result = UpdateResult {
            target_id: target.id.clone(),
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            old_digest: service.current_digest.clone(),
            new_digest: service.current_digest.clone(),
            success: false,
            error: None,
            probe_results: Vec::new(),
            rollback_performed: false,
            rollback_digest: None,
            skipped: false,
            started_at,
            completed_at: None,
        };

        if dry_run {
            result.new_digest = expected_new_digest.to_string();
            result.success = true;
            result.completed_at = Some(Utc::now());
            return result;
        }

        let _guard = match self.locks.lock(&target.id, self.lock_timeout, cancel) {
            Ok(guard) => guard,
            Err(e) => {
                result.error = Some(e.to_string());
                result.completed_at = Some(Utc::now());
                return result;
            }
        };

        if self.targets_self(target, service, cancel) && !self.allow_self_update {
            reporter.warn(&format!(
                "refusing to update {}/{}: it looks like bulwark's own container (set BULWARK_ALLOW_SELF_UPDATE to override)",
                target.name, service.name
            ));
            result.error = Some("skipped: target shares the runtime's own compose project/service".to_string());
            result.skipped = true;
            result.completed_at = Some(Utc::now());
            return result;
        }

        let (compose_files, compose_service) = match self.resolve_compose_target(target, service) {
            Ok(v) => v,
            Err(e) => {
                result.error = Some(e.to_string());
                result.completed_at = Some(Utc::now());
                return result;
            }
        };

        if let Err(e) = self.runtime.compose_pull(&compose_files, &compose_service, cancel) {
            result.error = Some(format!("pull failed: {e:#}"));
            result.completed_at = Some(Utc::now());
            return result;
        }
        if let Err(e) = self.runtime.compose_up(&compose_files, &compose_service, true, cancel) {
            result.error = Some(format!("recreate failed: {e:#}"));
            result.completed_at = Some(Utc::now());
            return result;
        }

        result.new_digest = self
            .resolve_running_digest(target, service, cancel)
            .unwrap_or_else(|| expected_new_digest.to_string());
        result.success = true;

        let parsed = parse_labels(&service.image, &service.labels);
        if !matches!(parsed.labels.probe, ProbeConfig::None) {
            match self.find_container_id(target, service, cancel) {
                Some(container_id) => {
                    let probes = [parsed.labels.probe.clone()];
                    result.probe_results =
                        self.probes.run_probes(&probes, self.runtime.as_ref(), &container_id, &self.probe_defaults, cancel);
                    if !all_passed(&result.probe_results) {
                        reporter.warn(&format!("probe failed for {}/{}, rolling back", target.name, service.name));
                        result.success = false;
                    }
                }
                None => {
                    reporter.error(&format!("could not locate recreated container for {}/{}", target.name, service.name));
                    result.success = false;
                    result.error = Some("recreated container not found for probing".to_string());
                }
            }
        }

        if should_rollback(&result) {
            let old_digest = result.old_digest.clone();
            match self.rollback(&compose_files, &compose_service, &service.image, &old_digest, cancel) {
                Ok(()) => {
                    result.rollback_performed = true;
                    result.rollback_digest = Some(old_digest);
                }
                Err(e) => {
                    reporter.error(&format!("rollback for {}/{} failed: {e:#}", target.name, service.name));
                    result.error = Some(match result.error.take() {
                        Some(existing) => format!("{existing}; rollback also failed: {e:#}"),
                        None => format!("rollback failed: {e:#}"),
                    });
                }
            }
        }

        result.completed_at = Some(Utc::now());
        result
    }

    /// Strips any existing digest suffix off `image` to recover the
    /// base repository, pulls `<base>@<old_digest>`, and recreates via a
    /// single-service compose override so the original file is never
    /// touched. The override file is removed on every exit path.
    fn rollback(
        &self,
        compose_files: &[String],
        compose_service: &str,
        image: &str,
        old_digest: &str,
        cancel: &Cancellation,
    ) -> Result<()> {
        let base = image.split('@').next().unwrap_or(image);
        let rollback_ref = format!("{base}@{old_digest}");

        self.runtime.image_pull(&rollback_ref, cancel).context("pulling rollback digest")?;

        let override_file = tempfile::Builder::new()
            .prefix("bulwark-rollback-")
            .suffix(".yml")
            .tempfile()
            .context("creating rollback override file")?;
        std::fs::write(
            override_file.path(),
            format!("services:\n  {compose_service}:\n    image: {rollback_ref}\n"),
        )
        .context("writing rollback override file")?;

        let mut files = compose_files.to_vec();
        files.push(override_file.path().display().to_string());
        self.runtime
            .compose_up(&files, compose_service, true, cancel)
            .context("recreating with rollback override")
        // `override_file` is removed when it drops here, success or not.
    }

    fn resolve_compose_target(&self, target: &Target, service: &Service) -> Result<(Vec<String>, String)> {
        match target.kind {
            TargetKind::Compose => {
                let dir = target.path.trim_end_matches('/');
                Ok((vec![format!("{dir}/docker-compose.yml")], service.name.clone()))
            }
            TargetKind::Container => {
                let raw = service
                    .labels
                    .get("bulwark.definition")
                    .ok_or_else(|| anyhow!("loose container {} has no bulwark.definition label", service.name))?;
                let definition = Definition::parse(raw)?;
                Ok((vec![definition.compose_path], definition.service))
            }
        }
    }

    fn targets_self(&self, target: &Target, service: &Service, cancel: &Cancellation) -> bool {
        match self.runtime.self_container(cancel) {
            Ok(Some(self_container)) => {
                target.kind == TargetKind::Compose
                    && self_container.compose_project.as_deref() == Some(target.name.as_str())
                    && self_container.compose_service.as_deref() == Some(service.name.as_str())
            }
            _ => false,
        }
    }

    fn find_container_id(&self, target: &Target, service: &Service, cancel: &Cancellation) -> Option<String> {
        let containers = self.runtime.list_containers(true, cancel).ok()?;
        containers
            .into_iter()
            .find(|c| match target.kind {
                TargetKind::Compose => {
                    c.compose_project.as_deref() == Some(target.name.as_str())
                        && c.compose_service.as_deref() == Some(service.name.as_str())
                }
                TargetKind::Container => c.name == service.name,
            })
            .map(|c| c.id)
    }

    fn resolve_running_digest(&self, target: &Target, service: &Service, cancel: &Cancellation) -> Option<String> {
        let id = self.find_container_id(target, service, cancel)?;
        let inspected = self.runtime.inspect_container(&id, cancel).ok()?;
        if inspected.image_digest.is_empty() {
            None
        } else {
            Some(inspected.image_digest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_config::StderrReporter;
    use bulwark_runtime::{ContainerSummary, FakeRuntime};
    use bulwark_types::OutcomeLabel;
    use std::collections::BTreeMap;

    fn executor(runtime: Arc<FakeRuntime>) -> Executor {
        Executor::new(
            runtime,
            LockManager::new(),
            ProbeEngine::new().unwrap(),
            Duration::from_secs(5),
            ProbeDefaults { timeout: Duration::from_millis(50), retries: 1, retry_backoff: Duration::from_millis(1) },
            false,
        )
    }

    fn compose_target(name: &str, path: &str) -> Target {
        Target {
            id: Target::derive_id(TargetKind::Compose, name, path),
            kind: TargetKind::Compose,
            name: name.to_string(),
            path: path.to_string(),
            labels: BTreeMap::new(),
            services: Vec::new(),
        }
    }

    fn compose_service(target_id: &str, name: &str, extra_labels: &[(&str, &str)]) -> Service {
        let mut labels = BTreeMap::new();
        labels.insert("bulwark.enabled".to_string(), "true".to_string());
        for (k, v) in extra_labels {
            labels.insert(k.to_string(), v.to_string());
        }
        Service {
            id: Service::derive_id(target_id, name),
            target_id: target_id.to_string(),
            name: name.to_string(),
            image: "nginx:1.0".to_string(),
            current_digest: "sha256:old".to_string(),
            labels,
            health_check: None,
        }
    }

    fn container_for(target: &Target, service: &Service, id: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: service.name.clone(),
            image: service.image.clone(),
            image_digest: service.current_digest.clone(),
            labels: service.labels.clone(),
            running: true,
            compose_project: Some(target.name.clone()),
            compose_service: Some(service.name.clone()),
            compose_working_dir: Some(target.path.clone()),
        }
    }

    #[test]
    fn dry_run_reports_success_with_no_side_effects() {
        let rt = FakeRuntime::new();
        let target = compose_target("app", "/srv/app");
        let service = compose_service(&target.id, "web", &[]);
        let exec = executor(rt.clone());
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;

        let result = exec.execute_update(&target, &service, "sha256:new", true, &cancel, &mut reporter);
        assert!(result.success);
        assert_eq!(result.new_digest, "sha256:new");
        assert!(rt.calls().is_empty());
        assert_eq!(result.outcome(), OutcomeLabel::Success);
    }

    #[test]
    fn safe_stateless_update_with_passing_probe_succeeds() {
        let rt = FakeRuntime::new();
        let target = compose_target("app", "/srv/app");
        let service = compose_service(
            &target.id,
            "web",
            &[("bulwark.probe.type", "docker"), ("bulwark.policy", "safe")],
        );
        rt.add_container(container_for(&target, &service, "c1"));
        rt.set_pull_digest("web", "sha256:new");

        let exec = executor(rt.clone());
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        assert!(result.success);
        assert_eq!(result.new_digest, "sha256:new");
        assert!(!result.rollback_performed);
        assert_eq!(result.outcome(), OutcomeLabel::Success);
    }

    #[test]
    fn probe_failure_triggers_rollback_and_records_old_digest() {
        let rt = FakeRuntime::new();
        let target = compose_target("app", "/srv/app");
        let service = compose_service(
            &target.id,
            "web",
            &[("bulwark.probe.type", "http"), ("bulwark.probe.url", "http://127.0.0.1:1/nope")],
        );
        rt.add_container(container_for(&target, &service, "c1"));
        rt.set_pull_digest("web", "sha256:new");

        let exec = executor(rt.clone());
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        assert!(!result.success);
        assert!(result.rollback_performed);
        assert_eq!(result.rollback_digest.as_deref(), Some("sha256:old"));
        assert_eq!(result.outcome(), OutcomeLabel::RolledBack);
        assert!(rt.calls().iter().any(|c| matches!(c, bulwark_runtime::RecordedCall::ImagePull(r) if r.contains("@sha256:old"))));
    }

    #[test]
    fn self_update_guard_skips_without_allow_flag() {
        let rt = FakeRuntime::new();
        let target = compose_target("bulwark", "/srv/bulwark");
        let service = compose_service(&target.id, "core", &[]);
        rt.add_container(container_for(&target, &service, "self1"));
        rt.set_self_container("self1");

        let exec = executor(rt.clone());
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        assert!(!result.success);
        assert_eq!(result.new_digest, result.old_digest);
        assert_eq!(result.outcome(), OutcomeLabel::Skipped);
        assert!(rt.calls().is_empty());
    }

    #[test]
    fn self_update_guard_allows_when_flag_set() {
        let rt = FakeRuntime::new();
        let target = compose_target("bulwark", "/srv/bulwark");
        let service = compose_service(&target.id, "core", &[]);
        rt.add_container(container_for(&target, &service, "self1"));
        rt.set_self_container("self1");
        rt.set_pull_digest("core", "sha256:new");

        let exec = Executor::new(
            rt.clone(),
            LockManager::new(),
            ProbeEngine::new().unwrap(),
            Duration::from_secs(5),
            ProbeDefaults::default(),
            true,
        );
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        assert!(result.success);
    }

    #[test]
    fn lock_timeout_surfaces_as_failed_outcome() {
        let rt = FakeRuntime::new();
        let target = compose_target("app", "/srv/app");
        let service = compose_service(&target.id, "web", &[]);
        let locks = LockManager::new();
        let held = locks.lock(&target.id, Duration::from_secs(5), &Cancellation::new()).unwrap();

        let exec = Executor::new(
            rt,
            locks,
            ProbeEngine::new().unwrap(),
            Duration::from_millis(10),
            ProbeDefaults::default(),
            false,
        );
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        // A contended lock is an apply failure, not an intentional skip: it
        // must be persisted to history and counted toward the failure total.
        assert!(!result.success);
        assert!(!result.skipped);
        assert_eq!(result.outcome(), OutcomeLabel::Failed);
        held.unlock();
    }

    #[test]
    fn loose_container_reads_definition_label_for_compose_target() {
        let rt = FakeRuntime::new();
        let target = Target {
            id: Target::derive_id(TargetKind::Container, "container_abc123456789", ""),
            kind: TargetKind::Container,
            name: "container_abc123456789".to_string(),
            path: String::new(),
            labels: BTreeMap::new(),
            services: Vec::new(),
        };
        let service = compose_service(
            &target.id,
            "standalone",
            &[("bulwark.definition", "compose:/srv/other/docker-compose.yml#service=standalone")],
        );
        rt.add_container(ContainerSummary {
            id: "c1".into(),
            name: "standalone".into(),
            image: service.image.clone(),
            image_digest: "sha256:old".into(),
            labels: service.labels.clone(),
            running: true,
            compose_project: None,
            compose_service: None,
            compose_working_dir: None,
        });
        rt.set_pull_digest("standalone", "sha256:new");

        let exec = executor(rt.clone());
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let result = exec.execute_update(&target, &service, "sha256:new", false, &cancel, &mut reporter);

        assert!(result.success);
        assert!(rt.calls().iter().any(|c| matches!(
            c,
            bulwark_runtime::RecordedCall::ComposePull(files, svc)
                if files == "/srv/other/docker-compose.yml" && svc == "standalone"
        )));
    }
}
