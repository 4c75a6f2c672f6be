//! Cron-driven job scheduling. Jobs register before `start`; each
//! runs on its own thread, waking at every matching tick of its schedule
//! until `stop` is called. A job that errors is logged and does not stop
//! the scheduler or any other job.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_config::{Reporter, StderrReporter};
use bulwark_retry::Cancellation;
use chrono::Utc;
use cron::Schedule;

/// Bounded timeout applied to every scheduled job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const TICK: Duration = Duration::from_millis(200);

pub type Job = Arc<dyn Fn(&Cancellation) -> Result<()> + Send + Sync>;

struct JobEntry {
    name: String,
    schedule: Schedule,
    job: Job,
}

pub struct Scheduler {
    jobs: Mutex<Vec<JobEntry>>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    job_timeout: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TIMEOUT)
    }
}

impl Scheduler {
    pub fn new(job_timeout: Duration) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            job_timeout,
        }
    }

    /// Validates `expr` (a standard 5-field cron expression) and registers
    /// `job` to run on every matching tick once `start` is called.
    pub fn add_job(
        &self,
        name: impl Into<String>,
        expr: &str,
        job: impl Fn(&Cancellation) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let schedule = Schedule::from_str(&normalize_cron(expr)?)
            .with_context(|| format!("invalid cron expression {expr:?}"))?;
        self.jobs.lock().expect("scheduler jobs poisoned").push(JobEntry {
            name: name.into(),
            schedule,
            job: Arc::new(job),
        });
        Ok(())
    }

    /// Spawns one thread per registered job. A no-op if already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let jobs = self.jobs.lock().expect("scheduler jobs poisoned");
        let mut handles = self.handles.lock().expect("scheduler handles poisoned");
        for entry in jobs.iter() {
            let running = Arc::clone(&self.running);
            let schedule = entry.schedule.clone();
            let job = Arc::clone(&entry.job);
            let name = entry.name.clone();
            let job_timeout = self.job_timeout;
            handles.push(thread::spawn(move || run_loop(name, schedule, job, running, job_timeout)));
        }
    }

    /// Signals every job thread to stop at its next tick check and joins
    /// them. A no-op if already stopped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.lock().expect("scheduler handles poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("scheduler jobs poisoned").len()
    }
}

/// Jobs declare a standard 5-field schedule; the `cron` crate expects a
/// leading seconds field, so this widens it to fire on every matching
/// second of every matching minute.
fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!("expected a 5-field cron expression, got {expr:?}");
    }
    Ok(format!("* {expr}"))
}

fn run_loop(name: String, schedule: Schedule, job: Job, running: Arc<AtomicBool>, job_timeout: Duration) {
    let mut reporter = StderrReporter;
    while running.load(Ordering::SeqCst) {
        let Some(next) = schedule.upcoming(Utc).next() else {
            return;
        };
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            if Utc::now() >= next {
                break;
            }
            thread::sleep(TICK);
        }

        let cancel = Cancellation::with_timeout(job_timeout);
        if let Err(e) = job(&cancel) {
            reporter.error(&format!("scheduled job {name} failed: {e}"));
        }
    }
}
