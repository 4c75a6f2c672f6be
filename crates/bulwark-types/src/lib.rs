//! Core domain types shared by every component of the update pipeline:
//! image references, targets/services, label-derived policy, plans, update
//! results, and run history. Kept dependency-light so every other crate in
//! the workspace can depend on it without dragging in HTTP or process code.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Accepts either a humantime string (`"30s"`) or a millisecond integer.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serializes a `Duration` as milliseconds so it round-trips with `deserialize_duration`.
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn short_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(p.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// A parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parses `registry/repository:tag@digest`-shaped strings, filling in
    /// `docker.io`/`latest` defaults. A digest suffix takes addressing
    /// precedence over any tag present alongside it.
    pub fn parse(image: &str) -> anyhow::Result<Self> {
        if image.trim().is_empty() {
            anyhow::bail!("empty image reference");
        }

        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };

        // Split off registry: a leading segment counts as a registry host
        // only if it contains a '.', a ':', or is "localhost".
        let (registry, rest) = match rest.split_once('/') {
            Some((first, remainder)) if is_registry_host(first) => {
                (first.to_string(), remainder.to_string())
            }
            _ => (Self::DEFAULT_REGISTRY.to_string(), rest.to_string()),
        };

        // Split repository:tag, being careful that a tag never contains '/'.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (rest, Self::DEFAULT_TAG.to_string()),
        };

        if repository.is_empty() {
            anyhow::bail!("image reference {image:?} has an empty repository");
        }

        let repository = if registry == Self::DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The host used to compose the registry API URL.
    pub fn registry_host(&self) -> String {
        if self.registry == Self::DEFAULT_REGISTRY {
            "registry-1.docker.io".to_string()
        } else {
            self.registry.clone()
        }
    }

    /// Tag or digest to address the manifest by.
    pub fn manifest_reference(&self) -> &str {
        match &self.digest {
            Some(d) => d,
            None => &self.tag,
        }
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repo = if self.registry == Self::DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        match &self.digest {
            Some(d) => write!(f, "{repo}@{d}"),
            None => write!(f, "{repo}:{}", self.tag),
        }
    }
}

/// Strips a leading `sha256:` prefix, if present, for digest comparison.
pub fn strip_digest_prefix(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// `current != remote` after stripping `sha256:` from both. An empty
/// `current` always compares unequal (never seen running).
pub fn digests_differ(current: &str, remote: &str) -> bool {
    if current.is_empty() {
        return true;
    }
    strip_digest_prefix(current) != strip_digest_prefix(remote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Compose,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl Target {
    /// Deterministic id of `(type, name, path)`, stable across path renames
    /// because the store reconciles by `name` and preserves the first id.
    pub fn derive_id(kind: TargetKind, name: &str, path: &str) -> String {
        short_hex(&[
            match kind {
                TargetKind::Compose => "compose",
                TargetKind::Container => "container",
            },
            name,
            path,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub current_digest: String,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
}

impl Service {
    /// Deterministic id of `(target_id, name)`, stable on the same target.
    pub fn derive_id(target_id: &str, name: &str) -> String {
        short_hex(&[target_id, name])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Notify,
    #[default]
    Safe,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Stateless,
    Stateful,
}

/// Tagged union over the five probe kinds plus "none". Dispatch on this via
/// `match`, never by downcasting a trait object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    None,
    Docker,
    Http {
        url: String,
        #[serde(default = "default_expect_status")]
        expect_status: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Log {
        pattern: String,
        #[serde(default = "default_log_window_sec")]
        window_sec: u64,
    },
    Stability {
        #[serde(default = "default_stability_sec")]
        duration_sec: u64,
    },
}

fn default_expect_status() -> u16 {
    200
}
fn default_log_window_sec() -> u64 {
    30
}
fn default_stability_sec() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::None
    }
}

impl ProbeConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, ProbeConfig::None)
    }
}

/// `compose:<abs-path>#service=<name>`, used by loose containers to point
/// back at the compose project that actually owns the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub compose_path: String,
    pub service: String,
}

impl Definition {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let rest = raw
            .strip_prefix("compose:")
            .ok_or_else(|| anyhow::anyhow!("definition {raw:?} missing compose: prefix"))?;
        let (path, service) = rest
            .split_once("#service=")
            .ok_or_else(|| anyhow::anyhow!("definition {raw:?} missing #service= suffix"))?;
        if !path.starts_with('/') {
            anyhow::bail!("definition {raw:?} path must be absolute");
        }
        if service.is_empty() {
            anyhow::bail!("definition {raw:?} has an empty service name");
        }
        Ok(Self {
            compose_path: path.to_string(),
            service: service.to_string(),
        })
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compose:{}#service={}", self.compose_path, self.service)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub definition: Option<Definition>,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: Policy::default(),
            tier: Tier::default(),
            definition: None,
            probe: ProbeConfig::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTag {
    Safe,
    Notify,
    Stateful,
    ProbeMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub target_id: String,
    pub service_id: String,
    pub service_name: String,
    pub image: String,
    pub current_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_digest: Option<String>,
    pub update_available: bool,
    pub allowed: bool,
    pub reason: String,
    pub risk: RiskTag,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub generated_at: DateTime<Utc>,
    pub target_count: usize,
    pub service_count: usize,
    pub update_count: usize,
    pub allowed_count: usize,
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    None,
    Docker,
    Http,
    Tcp,
    Log,
    Stability,
}

impl From<&ProbeConfig> for ProbeKind {
    fn from(c: &ProbeConfig) -> Self {
        match c {
            ProbeConfig::None => ProbeKind::None,
            ProbeConfig::Docker => ProbeKind::Docker,
            ProbeConfig::Http { .. } => ProbeKind::Http,
            ProbeConfig::Tcp { .. } => ProbeKind::Tcp,
            ProbeConfig::Log { .. } => ProbeKind::Log,
            ProbeConfig::Stability { .. } => ProbeKind::Stability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub kind: ProbeKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub elapsed: Duration,
}

/// Outcome labels surfaced to history/metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeLabel {
    Success,
    RolledBack,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub target_id: String,
    pub service_id: String,
    pub service_name: String,
    pub old_digest: String,
    pub new_digest: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub probe_results: Vec<ProbeResult>,
    pub rollback_performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_digest: Option<String>,
    /// Set only for an intentional bypass (self-update guard). Distinct from
    /// `success=false` apply/probe/rollback failures: a skip never counts
    /// toward failure totals and is never persisted to history (§7, §4.7
    /// scenario 5).
    #[serde(default)]
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpdateResult {
    /// The outcome label used in history/metrics.
    pub fn outcome(&self) -> OutcomeLabel {
        if self.skipped {
            OutcomeLabel::Skipped
        } else if self.rollback_performed {
            OutcomeLabel::RolledBack
        } else if self.success {
            OutcomeLabel::Success
        } else {
            OutcomeLabel::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Plan,
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub applied: u32,
    pub skipped: u32,
    pub failed: u32,
    pub rollbacks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    Started,
    PlanGenerated { update_count: usize },
    ServiceStarted { target_id: String, service_id: String },
    ServiceCompleted { target_id: String, service_id: String, outcome: OutcomeLabel },
    Warning { message: String },
    Error { message: String },
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    #[serde(default)]
    pub events: Vec<RunEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_images() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "nginx:latest");
    }

    #[test]
    fn parses_user_repo_with_tag() {
        let r = ImageRef::parse("user/app:v1").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "user/app");
        assert_eq!(r.tag, "v1");
        assert_eq!(r.to_string(), "user/app:v1");
    }

    #[test]
    fn parses_custom_registry_with_digest() {
        let r = ImageRef::parse("ghcr.io/a/b@sha256:abcd").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "a/b");
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(r.to_string(), "ghcr.io/a/b@sha256:abcd");
    }

    #[test]
    fn digest_comparison_strips_prefix() {
        assert!(!digests_differ("sha256:aa", "aa"));
        assert!(digests_differ("sha256:aa", "sha256:bb"));
        assert!(digests_differ("", "sha256:bb"));
    }

    #[test]
    fn target_id_stable_across_path_rename() {
        let id1 = Target::derive_id(TargetKind::Compose, "myapp", "/srv/myapp/docker-compose.yml");
        let id2 = Target::derive_id(TargetKind::Compose, "myapp", "/srv/myapp/docker-compose.yaml");
        // Different path means a different derived id; id stability across
        // renames is the store's job (upsert-by-name), not the hash's.
        assert_ne!(id1, id2);
        let id1_again = Target::derive_id(TargetKind::Compose, "myapp", "/srv/myapp/docker-compose.yml");
        assert_eq!(id1, id1_again);
    }

    #[test]
    fn probe_config_serde_tagging() {
        let probe = ProbeConfig::Http {
            url: "http://svc/health".into(),
            expect_status: 200,
        };
        let json = serde_json::to_string(&probe).unwrap();
        assert!(json.contains("\"type\":\"http\""));
        let back: ProbeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn definition_round_trips() {
        let d = Definition::parse("compose:/srv/app/docker-compose.yml#service=web").unwrap();
        assert_eq!(d.compose_path, "/srv/app/docker-compose.yml");
        assert_eq!(d.service, "web");
        assert_eq!(d.to_string(), "compose:/srv/app/docker-compose.yml#service=web");
    }

    #[test]
    fn definition_rejects_relative_path() {
        assert!(Definition::parse("compose:rel/path.yml#service=web").is_err());
    }

    #[test]
    fn outcome_label_rollback_beats_failure() {
        let mut r = UpdateResult {
            target_id: "t".into(),
            service_id: "s".into(),
            service_name: "web".into(),
            old_digest: "sha256:a".into(),
            new_digest: "sha256:b".into(),
            success: false,
            error: None,
            probe_results: vec![],
            rollback_performed: true,
            rollback_digest: Some("sha256:a".into()),
            skipped: false,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        assert_eq!(r.outcome(), OutcomeLabel::RolledBack);
        r.rollback_performed = false;
        assert_eq!(r.outcome(), OutcomeLabel::Failed);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn image_ref_round_trips(repo in "[a-z][a-z0-9]{0,8}", tag in "[a-z0-9.]{1,8}") {
                let image = format!("{repo}:{tag}");
                let parsed = ImageRef::parse(&image).unwrap();
                let reparsed = ImageRef::parse(&parsed.to_string()).unwrap();
                prop_assert_eq!(parsed, reparsed);
            }

            #[test]
            fn digest_compare_is_prefix_insensitive(a in "[a-f0-9]{8}", b in "[a-f0-9]{8}") {
                let plain = digests_differ(&a, &b);
                let prefixed = digests_differ(&format!("sha256:{a}"), &format!("sha256:{b}"));
                prop_assert_eq!(plain, prefixed);
            }
        }
    }
}
