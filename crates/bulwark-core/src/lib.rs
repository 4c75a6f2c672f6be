//! The facade crate: wires discovery, the registry, labels, policy,
//! planning, locking, probing, execution, run history, scheduling, and
//! notification into the one `Bulwark` handle a caller (the CLI, or any
//! other embedder) actually needs. Nothing here re-implements any of the
//! update pipeline's logic; it only builds the concrete collaborators
//! (a `RegistryClient`, a `FileStore`/`InMemoryStore`, a `LockManager`,
//! a `ProbeEngine`) from `RuntimeOptions` and sequences calls across crates.

use std::sync::Arc;

use anyhow::Result;
use bulwark_config::{EnvOverrides, Reporter, RuntimeOptions, webhook_locks};
use bulwark_discover::discover_and_sync;
use bulwark_executor::Executor;
use bulwark_lock::LockManager;
use bulwark_notify::NotificationManager;
use bulwark_plan::{DigestResolver, Planner};
use bulwark_probe::ProbeEngine;
use bulwark_registry::RegistryClient;
use bulwark_retry::Cancellation;
use bulwark_runs::{RunManager, RunManagerConfig};
use bulwark_runtime::RuntimeDriver;
use bulwark_scheduler::Scheduler;
use bulwark_store::{FileStore, InMemoryStore, Store};
use bulwark_types::{
    OutcomeLabel, Plan, Run, RunEvent, RunEventKind, RunMode, RunStatus, RunSummary, Service, Target, UpdateResult,
};

/// Everything the update pipeline needs, built once per process from a
/// resolved [`RuntimeOptions`] and a concrete [`RuntimeDriver`]. The
/// driver is the one collaborator this crate never constructs itself —
/// callers supply it, whether that's a real Docker/Compose driver or, in
/// tests, the fake shipped by `bulwark-runtime`.
pub struct Bulwark {
    opts: RuntimeOptions,
    runtime: Arc<dyn RuntimeDriver>,
    store: Arc<dyn Store>,
    planner: Arc<Planner>,
    executor: Executor,
    runs: RunManager,
    notify: Arc<NotificationManager>,
    scheduler: Scheduler,
}

/// A snapshot combining recent run history with the live plan, the shape
/// the CLI's `status` command and a future HTTP+UI surface both want.
pub struct StatusReport {
    pub plan: Plan,
    pub recent_runs: Vec<Run>,
}

/// Environment/connectivity diagnostics for the CLI's `doctor` command;
/// never fails on its own (every check degrades to a `false`/message
/// rather than propagating an error), since its entire purpose is to be
/// runnable when something else is broken.
pub struct DoctorReport {
    pub runtime_reachable: bool,
    pub runtime_error: Option<String>,
    pub store_backend: &'static str,
    pub state_path: Option<String>,
    pub discord_locked: bool,
    pub slack_locked: bool,
    pub scheduled_jobs: usize,
}

impl Bulwark {
    /// Builds every collaborator from `opts`: a `FileStore` when
    /// `opts.state_db` is set, an `InMemoryStore` otherwise; a
    /// `RegistryClient` with its own write-once token cache; a fresh
    /// `LockManager`/`ProbeEngine` pair for the executor.
    pub fn new(runtime: Arc<dyn RuntimeDriver>, opts: RuntimeOptions) -> Result<Self> {
        let store: Arc<dyn Store> = match &opts.state_db {
            Some(path) => Arc::new(FileStore::open(path.clone())?),
            None => Arc::new(InMemoryStore::new()),
        };

        let registry: Arc<dyn DigestResolver> = Arc::new(RegistryClient::new()?);
        let planner = Arc::new(Planner::new(Arc::clone(&runtime), registry, opts.plan_cache_ttl));

        let executor = Executor::new(
            Arc::clone(&runtime),
            LockManager::new(),
            ProbeEngine::new()?,
            opts.lock_timeout,
            opts.probe_defaults.clone(),
            opts.allow_self_update,
        );

        let runs = RunManager::new(RunManagerConfig::default(), Some(Arc::clone(&store)));

        let locks = webhook_locks(&EnvOverrides::from_process());
        let notify = Arc::new(NotificationManager::new(Arc::clone(&store), &opts, locks)?);

        Ok(Self {
            opts,
            runtime,
            store,
            planner,
            executor,
            runs,
            notify,
            scheduler: Scheduler::new(bulwark_scheduler::DEFAULT_JOB_TIMEOUT),
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.opts
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<NotificationManager> {
        &self.notify
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    /// Discovers targets and reconciles them into the store, with
    /// id-stable upserts so a renamed compose path doesn't duplicate rows.
    pub fn discover(&self, cancel: &Cancellation) -> Result<Vec<Target>> {
        discover_and_sync(self.runtime.as_ref(), self.store.as_ref(), cancel)
    }

    /// Runs one plan-only pass, recording a `Run` of `mode=Plan` purely for
    /// audit purposes — no side effects against any target.
    pub fn plan(
        &self,
        target_filter: Option<&str>,
        include_disabled: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<(Run, Plan)> {
        let run = self.runs.create(RunMode::Plan)?;
        self.runs.add_event(&run.id, event(RunEventKind::Started))?;

        let plan = self.planner.plan(target_filter, include_disabled, cancel, reporter)?;
        self.runs
            .add_event(&run.id, event(RunEventKind::PlanGenerated { update_count: plan.update_count }))?;
        self.runs.complete(&run.id, RunStatus::Completed)?;

        let run = self.runs.get(&run.id)?.unwrap_or(run);
        Ok((run, plan))
    }

    /// Applies every allowed item in a fresh plan, sequentially, so
    /// operator-visible event streams stay ordered even though applies
    /// against distinct targets could run in parallel under the lock
    /// manager alone. Items the policy engine disallows are counted as
    /// skipped without ever reaching the executor; items the executor
    /// itself reports as a skip (self-update guard, lock contention) are
    /// counted as skipped and never written to history.
    pub fn apply(
        &self,
        target_filter: Option<&str>,
        dry_run: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<(Run, Vec<UpdateResult>)> {
        let run = self.runs.create(RunMode::Apply)?;
        self.runs.add_event(&run.id, event(RunEventKind::Started))?;

        let plan = self.planner.plan(target_filter, false, cancel, reporter)?;
        self.runs
            .add_event(&run.id, event(RunEventKind::PlanGenerated { update_count: plan.update_count }))?;

        let targets = self.discover(cancel)?;
        let mut summary = RunSummary::default();
        let mut results = Vec::new();

        for item in &plan.items {
            if cancel.is_cancelled() {
                reporter.warn("apply run cancelled, stopping before remaining items");
                break;
            }
            if !item.allowed {
                summary.skipped += 1;
                continue;
            }
            let Some((target, service)) = find_target_service(&targets, &item.target_id, &item.service_id) else {
                reporter.warn(&format!("planned service {} vanished before apply", item.service_name));
                summary.skipped += 1;
                continue;
            };

            self.runs.add_event(
                &run.id,
                event(RunEventKind::ServiceStarted {
                    target_id: target.id.clone(),
                    service_id: service.id.clone(),
                }),
            )?;

            let expected_digest = item.remote_digest.as_deref().unwrap_or(&service.current_digest);
            let result = self.executor.execute_update(target, service, expected_digest, dry_run, cancel, reporter);
            let outcome = result.outcome();

            match outcome {
                OutcomeLabel::Success => summary.applied += 1,
                OutcomeLabel::RolledBack => {
                    summary.failed += 1;
                    summary.rollbacks += 1;
                }
                OutcomeLabel::Failed => summary.failed += 1,
                OutcomeLabel::Skipped => summary.skipped += 1,
            }

            // A skip (self-update guard) never reaches history; every other
            // outcome, including lock timeouts and apply failures, is an
            // audited attempt and gets a row.
            if !matches!(outcome, OutcomeLabel::Skipped) {
                self.store.append_update_result(&result)?;
            }

            self.runs.add_event(
                &run.id,
                event(RunEventKind::ServiceCompleted {
                    target_id: target.id.clone(),
                    service_id: service.id.clone(),
                    outcome,
                }),
            )?;
            self.runs.update_summary(&run.id, summary)?;
            results.push(result);
        }

        let status = if summary.failed > 0 { RunStatus::Failed } else { RunStatus::Completed };
        self.runs.add_event(&run.id, event(RunEventKind::Completed))?;
        self.runs.complete(&run.id, status)?;

        let run = self.runs.get(&run.id)?.unwrap_or(run);
        Ok((run, results))
    }

    /// Registers the check (immediate-notification) and digest jobs from
    /// the notification manager's persisted settings and starts the
    /// scheduler. Idempotent: calling twice without an
    /// intervening `stop_scheduler` is a no-op because `Scheduler::start`
    /// is itself idempotent, but job registration only happens once here.
    pub fn start_scheduler(&self) -> Result<()> {
        if self.scheduler.job_count() == 0 {
            let settings = self.notify.settings();

            let planner = Arc::clone(&self.planner);
            let notify = Arc::clone(&self.notify);
            self.scheduler.add_job("notify-check", &settings.check_cron, move |cancel| {
                let mut reporter = bulwark_config::StderrReporter;
                notify.check_on_find(&planner, cancel, &mut reporter)?;
                Ok(())
            })?;

            let planner = Arc::clone(&self.planner);
            let notify = Arc::clone(&self.notify);
            self.scheduler.add_job("notify-digest", &settings.digest_cron, move |cancel| {
                let mut reporter = bulwark_config::StderrReporter;
                notify.send_digest(&planner, cancel, &mut reporter)?;
                Ok(())
            })?;
        }
        self.scheduler.start();
        Ok(())
    }

    pub fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    /// A status snapshot: the live (possibly cached) plan plus the most
    /// recent runs, for the CLI's `status` command and any future
    /// HTTP+UI surface.
    pub fn status(
        &self,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
        recent_limit: usize,
    ) -> Result<StatusReport> {
        let plan = self.planner.plan(None, true, cancel, reporter)?;
        let recent_runs = self.store.list_recent_runs(recent_limit)?;
        Ok(StatusReport { plan, recent_runs })
    }

    /// Best-effort environment diagnostics: whether the runtime driver can
    /// be reached, which store backend is active, and whether either
    /// webhook sink is environment-locked.
    pub fn doctor(&self, cancel: &Cancellation) -> DoctorReport {
        let (runtime_reachable, runtime_error) = match self.runtime.list_containers(true, cancel) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let locks = webhook_locks(&EnvOverrides::from_process());
        DoctorReport {
            runtime_reachable,
            runtime_error,
            store_backend: if self.opts.state_db.is_some() { "file" } else { "memory" },
            state_path: self.opts.state_db.as_ref().map(|p| p.display().to_string()),
            discord_locked: locks.discord_locked,
            slack_locked: locks.slack_locked,
            scheduled_jobs: self.scheduler.job_count(),
        }
    }
}

fn event(kind: RunEventKind) -> RunEvent {
    RunEvent { timestamp: chrono::Utc::now(), kind }
}

fn find_target_service<'a>(targets: &'a [Target], target_id: &str, service_id: &str) -> Option<(&'a Target, &'a Service)> {
    let target = targets.iter().find(|t| t.id == target_id)?;
    let service = target.services.iter().find(|s| s.id == service_id)?;
    Some((target, service))
}
