//! In-memory, bounded run/event history with optional write-through
//! persistence. The manager is the single source of truth for
//! "what is happening right now"; the store is just its mirror, consulted
//! only when a run has already been evicted from memory.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bulwark_store::Store;
use bulwark_types::{Run, RunEvent, RunMode, RunStatus, RunSummary};
use chrono::Utc;

#[derive(Debug, Clone, Copy)]
pub struct RunManagerConfig {
    pub max_runs: usize,
    pub max_events_per_run: usize,
    pub max_recent_events_global: usize,
}

impl Default for RunManagerConfig {
    fn default() -> Self {
        Self {
            max_runs: 100,
            max_events_per_run: 500,
            max_recent_events_global: 1000,
        }
    }
}

struct Inner {
    order: VecDeque<String>,
    runs: HashMap<String, Run>,
    recent_events: VecDeque<RunEvent>,
}

pub struct RunManager {
    config: RunManagerConfig,
    store: Option<Arc<dyn Store>>,
    inner: Mutex<Inner>,
}

impl RunManager {
    pub fn new(config: RunManagerConfig, store: Option<Arc<dyn Store>>) -> Self {
        Self {
            config,
            store,
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                runs: HashMap::new(),
                recent_events: VecDeque::new(),
            }),
        }
    }

    /// Starts a new run, evicting the oldest in-memory (and persisted,
    /// when a store is attached) run if `max_runs` is exceeded.
    pub fn create(&self, mode: RunMode) -> Result<Run> {
        let now = Utc::now();
        let run = Run {
            id: format!("{:016x}", rand::random::<u64>()),
            mode,
            status: RunStatus::Running,
            created_at: now,
            started_at: now,
            completed_at: None,
            summary: RunSummary::default(),
            events: Vec::new(),
        };

        let evicted = {
            let mut inner = self.inner.lock().expect("run manager poisoned");
            inner.order.push_back(run.id.clone());
            inner.runs.insert(run.id.clone(), run.clone());
            if inner.order.len() > self.config.max_runs {
                inner.order.pop_front()
            } else {
                None
            }
        };
        if let Some(evicted_id) = evicted {
            self.inner.lock().expect("run manager poisoned").runs.remove(&evicted_id);
            if let Some(store) = &self.store {
                store.delete_run(&evicted_id)?;
            }
        }

        if let Some(store) = &self.store {
            store.save_run(&run)?;
        }
        Ok(run)
    }

    /// Appends an event to the run and the global recent-events buffer,
    /// trimming both to their configured caps, and persists the event.
    pub fn add_event(&self, run_id: &str, event: RunEvent) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("run manager poisoned");
            if let Some(run) = inner.runs.get_mut(run_id) {
                run.events.push(event.clone());
                if run.events.len() > self.config.max_events_per_run {
                    let overflow = run.events.len() - self.config.max_events_per_run;
                    run.events.drain(0..overflow);
                }
            }
            inner.recent_events.push_back(event.clone());
            if inner.recent_events.len() > self.config.max_recent_events_global {
                inner.recent_events.pop_front();
            }
        }
        if let Some(store) = &self.store {
            store.save_run_event(run_id, &event)?;
        }
        Ok(())
    }

    /// Stores the latest progress counters for an in-flight run.
    pub fn update_summary(&self, run_id: &str, summary: RunSummary) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock().expect("run manager poisoned");
            if let Some(run) = inner.runs.get_mut(run_id) {
                run.summary = summary;
                Some(run.clone())
            } else {
                None
            }
        };
        if let (Some(run), Some(store)) = (updated, &self.store) {
            store.save_run(&run)?;
        }
        Ok(())
    }

    /// Marks a run finished, stamping `completed_at` and persisting the
    /// final summary.
    pub fn complete(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock().expect("run manager poisoned");
            if let Some(run) = inner.runs.get_mut(run_id) {
                run.status = status;
                run.completed_at = Some(Utc::now());
                Some(run.clone())
            } else {
                None
            }
        };
        if let (Some(run), Some(store)) = (updated, &self.store) {
            store.save_run(&run)?;
        }
        Ok(())
    }

    /// Returns a deep copy of the run, including its events, falling back
    /// to the store when it has already been evicted from memory.
    pub fn get(&self, run_id: &str) -> Result<Option<Run>> {
        if let Some(run) = self.inner.lock().expect("run manager poisoned").runs.get(run_id).cloned() {
            return Ok(Some(run));
        }
        match &self.store {
            Some(store) => match store.get_run(run_id)? {
                Some(mut run) => {
                    run.events = store.get_run_events(run_id)?;
                    Ok(Some(run))
                }
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// A trailing slice (newest last) of the global recent-events buffer.
    pub fn recent_events(&self, limit: usize) -> Vec<RunEvent> {
        let inner = self.inner.lock().expect("run manager poisoned");
        let start = inner.recent_events.len().saturating_sub(limit);
        inner.recent_events.iter().skip(start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_store::InMemoryStore;
    use bulwark_types::{OutcomeLabel, RunEventKind};

    fn started_event() -> RunEvent {
        RunEvent { timestamp: Utc::now(), kind: RunEventKind::Started }
    }

    #[test]
    fn create_assigns_running_status_and_timestamps() {
        let mgr = RunManager::new(RunManagerConfig::default(), None);
        let run = mgr.create(RunMode::Plan).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        assert_eq!(run.id.len(), 16);
    }

    #[test]
    fn add_event_appends_to_run_and_global_buffer() {
        let mgr = RunManager::new(RunManagerConfig::default(), None);
        let run = mgr.create(RunMode::Apply).unwrap();
        mgr.add_event(&run.id, started_event()).unwrap();
        let fetched = mgr.get(&run.id).unwrap().unwrap();
        assert_eq!(fetched.events.len(), 1);
        assert_eq!(mgr.recent_events(10).len(), 1);
    }

    #[test]
    fn events_trim_to_per_run_cap() {
        let config = RunManagerConfig { max_events_per_run: 3, ..RunManagerConfig::default() };
        let mgr = RunManager::new(config, None);
        let run = mgr.create(RunMode::Apply).unwrap();
        for _ in 0..5 {
            mgr.add_event(&run.id, started_event()).unwrap();
        }
        let fetched = mgr.get(&run.id).unwrap().unwrap();
        assert_eq!(fetched.events.len(), 3);
    }

    #[test]
    fn complete_sets_status_and_completed_at() {
        let mgr = RunManager::new(RunManagerConfig::default(), None);
        let run = mgr.create(RunMode::Apply).unwrap();
        mgr.complete(&run.id, RunStatus::Completed).unwrap();
        let fetched = mgr.get(&run.id).unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert!(fetched.completed_at.is_some());
    }

    #[test]
    fn update_summary_stores_latest_counters() {
        let mgr = RunManager::new(RunManagerConfig::default(), None);
        let run = mgr.create(RunMode::Apply).unwrap();
        mgr.update_summary(&run.id, RunSummary { applied: 2, skipped: 1, failed: 0, rollbacks: 0 }).unwrap();
        let fetched = mgr.get(&run.id).unwrap().unwrap();
        assert_eq!(fetched.summary.applied, 2);
    }

    #[test]
    fn oldest_run_evicted_once_capacity_exceeded() {
        let config = RunManagerConfig { max_runs: 2, ..RunManagerConfig::default() };
        let mgr = RunManager::new(config, None);
        let first = mgr.create(RunMode::Plan).unwrap();
        mgr.create(RunMode::Plan).unwrap();
        mgr.create(RunMode::Plan).unwrap();
        assert!(mgr.get(&first.id).unwrap().is_none());
    }

    #[test]
    fn eviction_also_removes_from_attached_store() {
        let store = Arc::new(InMemoryStore::new());
        let config = RunManagerConfig { max_runs: 1, ..RunManagerConfig::default() };
        let mgr = RunManager::new(config, Some(store.clone()));
        let first = mgr.create(RunMode::Plan).unwrap();
        mgr.create(RunMode::Plan).unwrap();
        assert!(store.get_run(&first.id).unwrap().is_none());
    }

    #[test]
    fn get_falls_back_to_store_after_eviction() {
        let store = Arc::new(InMemoryStore::new());
        let config = RunManagerConfig { max_runs: 1, ..RunManagerConfig::default() };
        let mgr = RunManager::new(config, Some(store));
        let first = mgr.create(RunMode::Plan).unwrap();
        mgr.add_event(&first.id, started_event()).unwrap();
        mgr.create(RunMode::Plan).unwrap();

        let fetched = mgr.get(&first.id).unwrap().unwrap();
        assert_eq!(fetched.events.len(), 1);
    }

    #[test]
    fn recent_events_returns_trailing_slice() {
        let mgr = RunManager::new(RunManagerConfig::default(), None);
        let run = mgr.create(RunMode::Apply).unwrap();
        for _ in 0..5 {
            mgr.add_event(&run.id, started_event()).unwrap();
        }
        mgr.add_event(
            &run.id,
            RunEvent {
                timestamp: Utc::now(),
                kind: RunEventKind::ServiceCompleted {
                    target_id: "t".into(),
                    service_id: "s".into(),
                    outcome: OutcomeLabel::Success,
                },
            },
        )
        .unwrap();

        let recent = mgr.recent_events(2);
        assert_eq!(recent.len(), 2);
        assert!(matches!(recent[1].kind, RunEventKind::ServiceCompleted { .. }));
    }
}
