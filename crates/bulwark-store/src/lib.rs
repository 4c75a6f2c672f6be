//! The persistence-store contract: key/value and tabular storage for
//! targets, services, update history, runs, run events, and settings. The
//! core only ever depends on the `Store` trait; `FileStore` (JSON files
//! with atomic tmp+rename writes, mirroring this codebase's state-file
//! discipline) and `InMemoryStore` (for tests) are the two implementations
//! shipped alongside it.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_types::{Run, RunEvent, Service, Target, UpdateResult};
use chrono::Utc;

pub trait Store: Send + Sync {
    /// Upserts by `(name)`: if a target with the same name already exists,
    /// its stored id is preserved (and returned) even if `target.id`
    /// differs — this is what keeps ids stable across path renames
    /// (`.yml` → `.yaml`).
    fn upsert_target(&self, target: &Target) -> Result<Target>;
    fn upsert_service(&self, service: &Service) -> Result<Service>;
    fn get_target(&self, id: &str) -> Result<Option<Target>>;
    fn list_targets(&self) -> Result<Vec<Target>>;

    fn append_update_result(&self, result: &UpdateResult) -> Result<()>;
    fn list_update_results(
        &self,
        target_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Vec<UpdateResult>>;
    fn last_successful_update(&self, service_id: &str) -> Result<Option<UpdateResult>>;

    fn save_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, id: &str) -> Result<Option<Run>>;
    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>>;
    /// Removes a run and its events from the persistent mirror, for the
    /// run manager's capacity eviction.
    fn delete_run(&self, id: &str) -> Result<()>;
    fn save_run_event(&self, run_id: &str, event: &RunEvent) -> Result<()>;
    fn get_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Removes update-result rows older than `max_age`; returns the count
    /// removed.
    fn prune_history_older_than(&self, max_age: Duration) -> Result<usize>;
    /// Removes targets (and their services) whose id is absent from
    /// `seen_ids` — the set produced by the most recent discovery pass.
    fn prune_stale_targets(&self, seen_ids: &[String]) -> Result<usize>;
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
struct StoreData {
    targets: Vec<Target>,
    services: Vec<Service>,
    update_results: Vec<UpdateResult>,
    runs: Vec<Run>,
    run_events: HashMap<String, Vec<RunEvent>>,
    settings: HashMap<String, String>,
}

/// Shared upsert/query logic over `StoreData`, used by both the in-memory
/// and file-backed stores so the reconciliation rules live in one place.
impl StoreData {
    fn upsert_target(&mut self, target: &Target) -> Target {
        if let Some(existing) = self.targets.iter_mut().find(|t| t.name == target.name) {
            let mut reconciled = target.clone();
            reconciled.id = existing.id.clone();
            *existing = reconciled.clone();
            reconciled
        } else {
            self.targets.push(target.clone());
            target.clone()
        }
    }

    fn upsert_service(&mut self, service: &Service) -> Service {
        if let Some(existing) = self
            .services
            .iter_mut()
            .find(|s| s.target_id == service.target_id && s.name == service.name)
        {
            let mut reconciled = service.clone();
            reconciled.id = existing.id.clone();
            *existing = reconciled.clone();
            reconciled
        } else {
            self.services.push(service.clone());
            service.clone()
        }
    }

    fn prune_stale_targets(&mut self, seen_ids: &[String]) -> usize {
        let before = self.targets.len();
        self.targets.retain(|t| seen_ids.contains(&t.id));
        self.services.retain(|s| self.targets.iter().any(|t| t.id == s.target_id));
        before - self.targets.len()
    }

    fn prune_history_older_than(&mut self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let before = self.update_results.len();
        self.update_results.retain(|r| r.started_at >= cutoff);
        before - self.update_results.len()
    }
}

/// An in-memory store for tests — no filesystem dependency, guarded by a
/// single mutex like the rest of this codebase's shared-state components.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<StoreData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn upsert_target(&self, target: &Target) -> Result<Target> {
        Ok(self.data.lock().unwrap().upsert_target(target))
    }

    fn upsert_service(&self, service: &Service) -> Result<Service> {
        Ok(self.data.lock().unwrap().upsert_service(service))
    }

    fn get_target(&self, id: &str) -> Result<Option<Target>> {
        Ok(self.data.lock().unwrap().targets.iter().find(|t| t.id == id).cloned())
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.data.lock().unwrap().targets.clone())
    }

    fn append_update_result(&self, result: &UpdateResult) -> Result<()> {
        self.data.lock().unwrap().update_results.push(result.clone());
        Ok(())
    }

    fn list_update_results(
        &self,
        target_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Vec<UpdateResult>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .update_results
            .iter()
            .filter(|r| target_id.is_none_or(|t| r.target_id == t))
            .filter(|r| service_id.is_none_or(|s| r.service_id == s))
            .cloned()
            .collect())
    }

    fn last_successful_update(&self, service_id: &str) -> Result<Option<UpdateResult>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .update_results
            .iter()
            .filter(|r| r.service_id == service_id && r.success)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        } else {
            data.runs.push(run.clone());
        }
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.data.lock().unwrap().runs.iter().find(|r| r.id == id).cloned())
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let data = self.data.lock().unwrap();
        let mut runs = data.runs.clone();
        runs.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn delete_run(&self, id: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.runs.retain(|r| r.id != id);
        data.run_events.remove(id);
        Ok(())
    }

    fn save_run_event(&self, run_id: &str, event: &RunEvent) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .run_events
            .entry(run_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn get_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        Ok(self.data.lock().unwrap().run_events.get(run_id).cloned().unwrap_or_default())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.data.lock().unwrap().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn prune_history_older_than(&self, max_age: Duration) -> Result<usize> {
        Ok(self.data.lock().unwrap().prune_history_older_than(max_age))
    }

    fn prune_stale_targets(&self, seen_ids: &[String]) -> Result<usize> {
        Ok(self.data.lock().unwrap().prune_stale_targets(seen_ids))
    }
}

/// A JSON-file-backed store. All mutations go through a single mutex and
/// an atomic tmp-then-rename write, the same discipline this codebase
/// uses for its own state file.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read store file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse store file {}", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data: Mutex::new(data) })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data).context("failed to serialize store data")?;
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("failed to create tmp store file {}", tmp.display()))?;
            f.write_all(&json)
                .with_context(|| format!("failed to write tmp store file {}", tmp.display()))?;
            f.sync_all().ok();
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename {} to {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }
}

impl Store for FileStore {
    fn upsert_target(&self, target: &Target) -> Result<Target> {
        let mut data = self.data.lock().unwrap();
        let reconciled = data.upsert_target(target);
        self.persist(&data)?;
        Ok(reconciled)
    }

    fn upsert_service(&self, service: &Service) -> Result<Service> {
        let mut data = self.data.lock().unwrap();
        let reconciled = data.upsert_service(service);
        self.persist(&data)?;
        Ok(reconciled)
    }

    fn get_target(&self, id: &str) -> Result<Option<Target>> {
        Ok(self.data.lock().unwrap().targets.iter().find(|t| t.id == id).cloned())
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.data.lock().unwrap().targets.clone())
    }

    fn append_update_result(&self, result: &UpdateResult) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.update_results.push(result.clone());
        self.persist(&data)
    }

    fn list_update_results(
        &self,
        target_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Vec<UpdateResult>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .update_results
            .iter()
            .filter(|r| target_id.is_none_or(|t| r.target_id == t))
            .filter(|r| service_id.is_none_or(|s| r.service_id == s))
            .cloned()
            .collect())
    }

    fn last_successful_update(&self, service_id: &str) -> Result<Option<UpdateResult>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .update_results
            .iter()
            .filter(|r| r.service_id == service_id && r.success)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        } else {
            data.runs.push(run.clone());
        }
        self.persist(&data)
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.data.lock().unwrap().runs.iter().find(|r| r.id == id).cloned())
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let data = self.data.lock().unwrap();
        let mut runs = data.runs.clone();
        runs.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn delete_run(&self, id: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.runs.retain(|r| r.id != id);
        data.run_events.remove(id);
        self.persist(&data)
    }

    fn save_run_event(&self, run_id: &str, event: &RunEvent) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.run_events.entry(run_id.to_string()).or_default().push(event.clone());
        self.persist(&data)
    }

    fn get_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        Ok(self.data.lock().unwrap().run_events.get(run_id).cloned().unwrap_or_default())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.settings.insert(key.to_string(), value.to_string());
        self.persist(&data)
    }

    fn prune_history_older_than(&self, max_age: Duration) -> Result<usize> {
        let mut data = self.data.lock().unwrap();
        let removed = data.prune_history_older_than(max_age);
        self.persist(&data)?;
        Ok(removed)
    }

    fn prune_stale_targets(&self, seen_ids: &[String]) -> Result<usize> {
        let mut data = self.data.lock().unwrap();
        let removed = data.prune_stale_targets(seen_ids);
        self.persist(&data)?;
        Ok(removed)
    }
}
