//! The container runtime driver contract: the abstract interface the
//! core depends on for every side effect against real containers. The core
//! never shells out to Docker/Compose directly — it only ever talks to
//! this trait, which keeps the update pipeline testable against an
//! in-memory fake and swappable for a real driver outside this crate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bulwark_retry::Cancellation;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    NoHealthcheck,
    Starting,
    Healthy,
    Unhealthy,
}

/// One entry from `list_containers`.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    /// The image's content digest as currently running, `sha256:`-prefixed.
    /// Empty if the runtime can't report it (never-seen-running case).
    pub image_digest: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    pub compose_project: Option<String>,
    pub compose_service: Option<String>,
    pub compose_working_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub id: String,
    pub running: bool,
    pub health: HealthStatus,
    pub image_digest: String,
    pub compose_project: Option<String>,
    pub compose_service: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageInspect {
    pub id: String,
    pub digest: String,
}

/// The runtime-driver contract consumed by discovery, the executor, and
/// the probe engine. Implementations must honor `cancel` on anything
/// that can block.
pub trait RuntimeDriver: Send + Sync {
    fn list_containers(&self, all: bool, cancel: &Cancellation) -> Result<Vec<ContainerSummary>>;
    fn inspect_container(&self, id: &str, cancel: &Cancellation) -> Result<ContainerInspect>;
    fn inspect_image(&self, id: &str, cancel: &Cancellation) -> Result<ImageInspect>;
    fn image_pull(&self, image_ref: &str, cancel: &Cancellation) -> Result<()>;
    fn image_tag(&self, src: &str, dst: &str) -> Result<()>;
    fn container_restart(&self, id: &str) -> Result<()>;
    fn container_logs_since(&self, id: &str, since: DateTime<Utc>, tail: usize) -> Result<Vec<u8>>;

    /// `docker compose pull <service>` using the project's compose file(s).
    fn compose_pull(&self, compose_files: &[String], service: &str, cancel: &Cancellation) -> Result<()>;
    /// `docker compose up -d --force-recreate --no-deps <service>`.
    fn compose_up(
        &self,
        compose_files: &[String],
        service: &str,
        force_recreate: bool,
        cancel: &Cancellation,
    ) -> Result<()>;

    /// Identifies the container running the current process, if any, so
    /// the executor's self-update guard can compare compose
    /// project+service against the update target.
    fn self_container(&self, cancel: &Cancellation) -> Result<Option<ContainerInspect>>;
}

/// A recorded call, kept for tests that assert on side-effect ordering
/// (e.g. "pull happened before up").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    ImagePull(String),
    ImageTag(String, String),
    ContainerRestart(String),
    ComposePull(String, String),
    ComposeUp(String, String, bool),
}

/// An in-memory fake runtime driver. Tests configure containers and
/// optional per-image digests, then drive the executor/probe engine/
/// discoverer against it without shelling out to a real container
/// runtime, matching the trait/fake pairing used elsewhere in this stack.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeRuntimeState>,
}

#[derive(Debug, Default)]
struct FakeRuntimeState {
    containers: Vec<ContainerSummary>,
    /// `image ref -> digest` the next pull/recreate will observe.
    pull_digests: BTreeMap<String, String>,
    logs: BTreeMap<String, Vec<u8>>,
    self_container_id: Option<String>,
    calls: Vec<RecordedCall>,
    fail_pull: bool,
    fail_up: bool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_container(&self, container: ContainerSummary) {
        self.inner.lock().unwrap().containers.push(container);
    }

    pub fn set_pull_digest(&self, image: &str, digest: &str) {
        self.inner
            .lock()
            .unwrap()
            .pull_digests
            .insert(image.to_string(), digest.to_string());
    }

    pub fn set_logs(&self, container_id: &str, logs: Vec<u8>) {
        self.inner.lock().unwrap().logs.insert(container_id.to_string(), logs);
    }

    pub fn set_self_container(&self, id: &str) {
        self.inner.lock().unwrap().self_container_id = Some(id.to_string());
    }

    pub fn set_container_digest(&self, container_id: &str, digest: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.id == container_id) {
            c.image_digest = digest.to_string();
        }
    }

    pub fn fail_next_pull(&self) {
        self.inner.lock().unwrap().fail_pull = true;
    }

    pub fn fail_next_up(&self) {
        self.inner.lock().unwrap().fail_up = true;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl RuntimeDriver for FakeRuntime {
    fn list_containers(&self, all: bool, _cancel: &Cancellation) -> Result<Vec<ContainerSummary>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .cloned()
            .collect())
    }

    fn inspect_container(&self, id: &str, _cancel: &Cancellation) -> Result<ContainerInspect> {
        let state = self.inner.lock().unwrap();
        let c = state
            .containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        Ok(ContainerInspect {
            id: c.id.clone(),
            running: c.running,
            health: HealthStatus::NoHealthcheck,
            image_digest: c.image_digest.clone(),
            compose_project: c.compose_project.clone(),
            compose_service: c.compose_service.clone(),
        })
    }

    fn inspect_image(&self, id: &str, _cancel: &Cancellation) -> Result<ImageInspect> {
        let state = self.inner.lock().unwrap();
        let digest = state
            .pull_digests
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        Ok(ImageInspect { id: id.to_string(), digest })
    }

    fn image_pull(&self, image_ref: &str, _cancel: &Cancellation) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_pull {
            state.fail_pull = false;
            anyhow::bail!("simulated pull failure for {image_ref}");
        }
        state.calls.push(RecordedCall::ImagePull(image_ref.to_string()));
        Ok(())
    }

    fn image_tag(&self, src: &str, dst: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(RecordedCall::ImageTag(src.to_string(), dst.to_string()));
        Ok(())
    }

    fn container_restart(&self, id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(RecordedCall::ContainerRestart(id.to_string()));
        Ok(())
    }

    fn container_logs_since(&self, id: &str, _since: DateTime<Utc>, tail: usize) -> Result<Vec<u8>> {
        let state = self.inner.lock().unwrap();
        let logs = state.logs.get(id).cloned().unwrap_or_default();
        let lines: Vec<&[u8]> = logs.split(|b| *b == b'\n').collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join(&b'\n'))
    }

    fn compose_pull(&self, compose_files: &[String], service: &str, _cancel: &Cancellation) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_pull {
            state.fail_pull = false;
            anyhow::bail!("simulated compose pull failure for {service}");
        }
        state
            .calls
            .push(RecordedCall::ComposePull(compose_files.join(","), service.to_string()));
        Ok(())
    }

    fn compose_up(
        &self,
        compose_files: &[String],
        service: &str,
        force_recreate: bool,
        _cancel: &Cancellation,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_up {
            state.fail_up = false;
            anyhow::bail!("simulated compose up failure for {service}");
        }
        if let Some(digest) = state.pull_digests.get(service).cloned()
            && let Some(c) = state.containers.iter_mut().find(|c| c.name == service)
        {
            c.image_digest = digest;
        }
        state.calls.push(RecordedCall::ComposeUp(
            compose_files.join(","),
            service.to_string(),
            force_recreate,
        ));
        Ok(())
    }

    fn self_container(&self, cancel: &Cancellation) -> Result<Option<ContainerInspect>> {
        let id = self.inner.lock().unwrap().self_container_id.clone();
        match id {
            Some(id) => Ok(Some(self.inspect_container(&id, cancel)?)),
            None => Ok(None),
        }
    }
}
