//! Joins discovery, the registry, and the policy engine into a `Plan`.
//! The only stateful part is the bounded-TTL cache for the
//! unfiltered, non-disabled-included plan shape — the one the scheduler
//! and notifier hit repeatedly.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bulwark_config::Reporter;
use bulwark_discover::discover;
use bulwark_labels::parse_labels;
use bulwark_policy::evaluate;
use bulwark_retry::Cancellation;
use bulwark_runtime::RuntimeDriver;
use bulwark_types::{Plan, PlanItem, Policy, ProbeConfig, RiskTag, Tier, digests_differ};
use chrono::Utc;

/// A registry lookup, abstracted so the planner doesn't depend on
/// `bulwark-registry`'s HTTP client directly — tests substitute a fake.
pub trait DigestResolver: Send + Sync {
    fn fetch_digest(&self, image: &str) -> Result<String>;
}

impl DigestResolver for bulwark_registry::RegistryClient {
    fn fetch_digest(&self, image: &str) -> Result<String> {
        bulwark_registry::RegistryClient::fetch_digest(self, image)
    }
}

pub struct Planner {
    runtime: Arc<dyn RuntimeDriver>,
    registry: Arc<dyn DigestResolver>,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Plan)>>,
}

impl Planner {
    pub fn new(runtime: Arc<dyn RuntimeDriver>, registry: Arc<dyn DigestResolver>, cache_ttl: Duration) -> Self {
        Self {
            runtime,
            registry,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Builds (or reuses a cached) plan. Only the unfiltered,
    /// include_disabled=false shape is cacheable.
    pub fn plan(
        &self,
        target_filter: Option<&str>,
        include_disabled: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<Plan> {
        let cacheable = target_filter.is_none() && !include_disabled;
        if cacheable
            && let Some((cached_at, plan)) = self.cache.lock().expect("plan cache poisoned").clone()
            && cached_at.elapsed() < self.cache_ttl
        {
            return Ok(plan);
        }

        let plan = self.build_plan(target_filter, include_disabled, cancel, reporter)?;
        if cacheable {
            *self.cache.lock().expect("plan cache poisoned") = Some((Instant::now(), plan.clone()));
        }
        Ok(plan)
    }

    fn build_plan(
        &self,
        target_filter: Option<&str>,
        include_disabled: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<Plan> {
        let targets = discover(self.runtime.as_ref(), cancel)?;
        let mut items = Vec::new();
        let mut target_count = 0usize;

        for target in &targets {
            if let Some(filter) = target_filter
                && target.name != filter
                && target.id != filter
            {
                continue;
            }
            target_count += 1;

            for service in &target.services {
                let parsed = parse_labels(&service.image, &service.labels);
                if !include_disabled && !parsed.labels.enabled {
                    continue;
                }
                let mut warnings = parsed.warnings.clone();

                let (remote_digest, update_available, mut reason, registry_failed) =
                    match self.registry.fetch_digest(&service.image) {
                        Ok(remote) => {
                            let available = digests_differ(&service.current_digest, &remote);
                            let reason = if service.current_digest.is_empty() {
                                "no current digest"
                            } else if available {
                                "digest mismatch"
                            } else {
                                "up to date"
                            };
                            (Some(remote), available, reason.to_string(), false)
                        }
                        Err(e) => {
                            let message = e.to_string();
                            warnings.push(format!("registry fetch failed: {message}"));
                            (None, false, message, true)
                        }
                    };

                let decision = evaluate(
                    parsed.labels.enabled,
                    parsed.labels.policy,
                    parsed.labels.tier,
                    &parsed.labels.probe,
                    update_available,
                    reporter,
                );
                if !registry_failed && !decision.allowed {
                    reason = decision.reason.clone();
                }

                let risk = if parsed.labels.policy == Policy::Notify {
                    RiskTag::Notify
                } else if parsed.labels.tier == Tier::Stateful {
                    RiskTag::Stateful
                } else if matches!(parsed.labels.probe, ProbeConfig::None) {
                    RiskTag::ProbeMissing
                } else {
                    RiskTag::Safe
                };

                items.push(PlanItem {
                    target_id: target.id.clone(),
                    service_id: service.id.clone(),
                    service_name: service.name.clone(),
                    image: service.image.clone(),
                    current_digest: service.current_digest.clone(),
                    remote_digest,
                    update_available,
                    allowed: decision.allowed,
                    reason,
                    risk,
                    warnings,
                });
            }
        }

        let update_count = items.iter().filter(|i| i.update_available).count();
        let allowed_count = items.iter().filter(|i| i.allowed).count();

        Ok(Plan {
            generated_at: Utc::now(),
            target_count,
            service_count: items.len(),
            update_count,
            allowed_count,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_config::StderrReporter;
    use bulwark_runtime::{ContainerSummary, FakeRuntime};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRegistry {
        digest: String,
        calls: AtomicUsize,
    }

    impl DigestResolver for FakeRegistry {
        fn fetch_digest(&self, _image: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.digest.clone())
        }
    }

    struct FailingRegistry;
    impl DigestResolver for FailingRegistry {
        fn fetch_digest(&self, _image: &str) -> Result<String> {
            anyhow::bail!("registry unreachable")
        }
    }

    fn managed_container(enabled_extra: &[(&str, &str)]) -> ContainerSummary {
        let mut labels = BTreeMap::new();
        labels.insert("bulwark.enabled".to_string(), "true".to_string());
        for (k, v) in enabled_extra {
            labels.insert(k.to_string(), v.to_string());
        }
        ContainerSummary {
            id: "c1".into(),
            name: "web".into(),
            image: "nginx:1.0".into(),
            image_digest: "sha256:old".into(),
            labels,
            running: true,
            compose_project: None,
            compose_service: None,
            compose_working_dir: None,
        }
    }

    #[test]
    fn allowed_update_available_with_matching_digest_mismatch_reason() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[
            ("bulwark.policy", "safe"),
            ("bulwark.probe.type", "http"),
            ("bulwark.probe.url", "http://localhost/health"),
        ]));
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let planner = Planner::new(rt, registry, Duration::from_secs(30));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let plan = planner.plan(None, false, &cancel, &mut reporter).unwrap();

        assert_eq!(plan.items.len(), 1);
        let item = &plan.items[0];
        assert!(item.update_available);
        assert!(item.allowed);
        assert_eq!(item.reason, "digest mismatch");
        assert_eq!(item.risk, RiskTag::Safe);
    }

    #[test]
    fn registry_failure_surfaces_error_as_reason() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[]));
        let planner = Planner::new(rt, Arc::new(FailingRegistry), Duration::from_secs(30));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let plan = planner.plan(None, false, &cancel, &mut reporter).unwrap();

        let item = &plan.items[0];
        assert!(!item.update_available);
        assert!(item.reason.contains("registry unreachable"));
    }

    #[test]
    fn notify_policy_is_tagged_notify_risk_and_denied() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[("bulwark.policy", "notify")]));
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let planner = Planner::new(rt, registry, Duration::from_secs(30));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let plan = planner.plan(None, false, &cancel, &mut reporter).unwrap();

        let item = &plan.items[0];
        assert!(!item.allowed);
        assert_eq!(item.reason, "notify only");
        assert_eq!(item.risk, RiskTag::Notify);
    }

    #[test]
    fn stateful_tier_tagged_regardless_of_policy() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[("bulwark.tier", "stateful"), ("bulwark.policy", "aggressive")]));
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let planner = Planner::new(rt, registry, Duration::from_secs(30));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;
        let plan = planner.plan(None, false, &cancel, &mut reporter).unwrap();

        assert_eq!(plan.items[0].risk, RiskTag::Stateful);
        assert!(plan.items[0].allowed);
    }

    #[test]
    fn disabled_services_excluded_unless_include_disabled() {
        let rt = FakeRuntime::new();
        let mut labels = BTreeMap::new();
        labels.insert("bulwark.policy".to_string(), "safe".to_string());
        rt.add_container(ContainerSummary {
            id: "c2".into(),
            name: "db".into(),
            image: "postgres:16".into(),
            image_digest: "sha256:old".into(),
            labels,
            running: true,
            compose_project: None,
            compose_service: None,
            compose_working_dir: None,
        });
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let planner = Planner::new(rt, registry, Duration::from_secs(30));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;

        let plan = planner.plan(None, false, &cancel, &mut reporter).unwrap();
        assert!(plan.items.is_empty());

        let plan_all = planner.plan(None, true, &cancel, &mut reporter).unwrap();
        assert_eq!(plan_all.items.len(), 1);
    }

    #[test]
    fn unfiltered_plan_is_cached_within_ttl() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[]));
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let registry_for_assert = Arc::clone(&registry);
        let planner = Planner::new(rt, registry, Duration::from_secs(60));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;

        planner.plan(None, false, &cancel, &mut reporter).unwrap();
        planner.plan(None, false, &cancel, &mut reporter).unwrap();
        assert_eq!(registry_for_assert.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filtered_plan_bypasses_cache() {
        let rt = FakeRuntime::new();
        rt.add_container(managed_container(&[]));
        let registry = Arc::new(FakeRegistry { digest: "sha256:new".into(), calls: AtomicUsize::new(0) });
        let registry_for_assert = Arc::clone(&registry);
        let planner = Planner::new(rt, registry, Duration::from_secs(60));
        let cancel = Cancellation::new();
        let mut reporter = StderrReporter;

        planner.plan(Some("container_c1"), false, &cancel, &mut reporter).unwrap();
        planner.plan(Some("container_c1"), false, &cancel, &mut reporter).unwrap();
        assert_eq!(registry_for_assert.calls.load(Ordering::SeqCst), 2);
    }
}
