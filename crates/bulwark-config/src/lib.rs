//! Ambient configuration layer shared by every entry point: a minimal
//! `Reporter` trait for structured progress/log lines, a layered settings
//! resolution (compiled-in defaults → `bulwark.toml` → environment), and
//! the single ordered strategy used to identify the process's own
//! container (needed by the executor's self-update guard).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_types::{Policy, ProbeConfig};
use serde::{Deserialize, Serialize};

/// A minimal structured logger threaded through discovery, planning,
/// execution, and notification dispatch. The CLI implementation writes
/// `[info]`/`[warn]`/`[error]`-prefixed lines to stderr; tests use an
/// in-memory collector.
pub trait Reporter: Send {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Writes to stderr with a level prefix, matching the rest of this stack's
/// observability surface (no tracing subscriber, just prefixed lines).
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Collects lines in memory; used by tests that want to assert on what was
/// reported without capturing stderr.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    pub lines: Vec<(&'static str, String)>,
}

impl Reporter for RecordingReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push(("info", msg.to_string()));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push(("warn", msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push(("error", msg.to_string()));
    }
}

/// Default timeout/retry/backoff applied to a probe when its labels don't
/// override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeDefaults {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// The process-lifetime, typed product of the configuration layering
/// below. Built once per process and threaded by reference into
/// discovery/planning/execution/notification.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub root: PathBuf,
    pub state_db: Option<PathBuf>,
    pub plan_cache_ttl: Duration,
    pub allow_self_update: bool,
    pub discord_webhook: Option<String>,
    pub slack_webhook: Option<String>,
    pub lock_timeout: Duration,
    pub probe_defaults: ProbeDefaults,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            state_db: None,
            plan_cache_ttl: Duration::from_secs(30),
            allow_self_update: false,
            discord_webhook: None,
            slack_webhook: None,
            lock_timeout: Duration::from_secs(60),
            probe_defaults: ProbeDefaults::default(),
        }
    }
}

/// The on-disk shape of `bulwark.toml`. Every field is optional so a
/// partial file only overrides what it names; unset fields fall through
/// to compiled-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub root: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    #[serde(with = "humantime_serde::option")]
    pub plan_cache_ttl: Option<Duration>,
    pub allow_self_update: Option<bool>,
    pub discord_webhook: Option<String>,
    pub slack_webhook: Option<String>,
    #[serde(with = "humantime_serde::option")]
    pub lock_timeout: Option<Duration>,
    pub probe_defaults: Option<ProbeDefaults>,
    pub default_policy: Option<Policy>,
}

impl FileConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Looks for `bulwark.toml` directly under `root`; returns `None` (not
    /// an error) if it doesn't exist.
    pub fn load_from_root(root: &Path) -> Result<Option<Self>> {
        let path = root.join("bulwark.toml");
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_path(&path).map(Some)
    }
}

/// The environment variables recognized by the core, applied last and
/// always winning over both defaults and the file.
pub struct EnvOverrides {
    vars: BTreeMap<String, String>,
}

impl EnvOverrides {
    /// Reads the real process environment.
    pub fn from_process() -> Self {
        Self::from_map(env::vars().collect())
    }

    /// Reads from an explicit map; used by tests so they don't have to
    /// mutate the real process environment.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn is_truthy(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }
}

/// Builds the final `RuntimeOptions` by layering defaults, an optional
/// file config, and environment overrides, in that precedence order
/// (environment wins, then file, then defaults).
pub fn build_runtime_options(file: Option<&FileConfig>, env: &EnvOverrides) -> RuntimeOptions {
    let mut opts = RuntimeOptions::default();

    if let Some(file) = file {
        if let Some(root) = &file.root {
            opts.root = root.clone();
        }
        if let Some(state_db) = &file.state_db {
            opts.state_db = Some(state_db.clone());
        }
        if let Some(ttl) = file.plan_cache_ttl {
            opts.plan_cache_ttl = ttl;
        }
        if let Some(allow) = file.allow_self_update {
            opts.allow_self_update = allow;
        }
        if let Some(url) = &file.discord_webhook {
            opts.discord_webhook = Some(url.clone());
        }
        if let Some(url) = &file.slack_webhook {
            opts.slack_webhook = Some(url.clone());
        }
        if let Some(timeout) = file.lock_timeout {
            opts.lock_timeout = timeout;
        }
        if let Some(defaults) = &file.probe_defaults {
            opts.probe_defaults = defaults.clone();
        }
    }

    if let Some(root) = env.get("BULWARK_ROOT") {
        opts.root = PathBuf::from(root);
    }
    if let Some(db) = env.get("BULWARK_STATE_DB") {
        opts.state_db = Some(PathBuf::from(db));
    }
    if let Some(ttl) = env.get("BULWARK_PLAN_CACHE_TTL")
        && let Ok(d) = humantime::parse_duration(ttl)
    {
        opts.plan_cache_ttl = d;
    }
    if let Some(flag) = env.get("BULWARK_ALLOW_SELF_UPDATE") {
        opts.allow_self_update = EnvOverrides::is_truthy(flag);
    }
    if let Some(url) = env.get("DISCORD_WEBHOOK_URL") {
        opts.discord_webhook = Some(url.to_string());
    }
    if let Some(url) = env.get("SLACK_WEBHOOK_URL") {
        opts.slack_webhook = Some(url.to_string());
    }

    opts
}

/// Whether each sink's webhook is locked by an environment variable (and so
/// the API surface should render it as a placeholder rather than an
/// editable field). Exposed for the notification manager and the HTTP+UI
/// surface that consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebhookLocks {
    pub discord_locked: bool,
    pub slack_locked: bool,
}

pub fn webhook_locks(env: &EnvOverrides) -> WebhookLocks {
    WebhookLocks {
        discord_locked: env.get("DISCORD_WEBHOOK_URL").is_some(),
        slack_locked: env.get("SLACK_WEBHOOK_URL").is_some(),
    }
}

/// Identifies the container the current process is running in, using a
/// single ordered strategy: explicit env var first, then
/// the cgroup/cpuset file, then hostname as a last resort. Used by the
/// executor's self-update guard to recognize when a planned update targets
/// the very process performing the update.
pub fn self_container_id() -> Option<String> {
    self_container_id_from(&env::var("BULWARK_CONTAINER_ID").ok(), Path::new("/proc/1/cpuset"))
}

fn self_container_id_from(explicit: &Option<String>, cpuset_path: &Path) -> Option<String> {
    if let Some(id) = explicit
        && !id.trim().is_empty()
    {
        return Some(id.trim().to_string());
    }

    if let Ok(content) = fs::read_to_string(cpuset_path)
        && let Some(id) = parse_cpuset(&content)
    {
        return Some(id);
    }

    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            gethostname::gethostname()
                .into_string()
                .ok()
                .filter(|h| !h.trim().is_empty())
        })
}

/// A cpuset entry looks like `/docker/<64-hex-id>` or
/// `/kubepods/.../<64-hex-id>`; the container id is the last path segment
/// that looks like a long hex string.
fn parse_cpuset(content: &str) -> Option<String> {
    content
        .trim()
        .rsplit('/')
        .find(|seg| seg.len() >= 12 && seg.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_map(pairs: &[(&str, &str)]) -> EnvOverrides {
        EnvOverrides::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_used_when_nothing_overrides() {
        let opts = build_runtime_options(None, &env_map(&[]));
        assert_eq!(opts.root, PathBuf::from("/"));
        assert!(!opts.allow_self_update);
        assert_eq!(opts.plan_cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn file_overrides_defaults() {
        let file = FileConfig {
            root: Some(PathBuf::from("/srv")),
            allow_self_update: Some(true),
            ..Default::default()
        };
        let opts = build_runtime_options(Some(&file), &env_map(&[]));
        assert_eq!(opts.root, PathBuf::from("/srv"));
        assert!(opts.allow_self_update);
    }

    #[test]
    fn env_overrides_file_and_defaults() {
        let file = FileConfig {
            root: Some(PathBuf::from("/srv")),
            ..Default::default()
        };
        let env = env_map(&[("BULWARK_ROOT", "/opt/bulwark")]);
        let opts = build_runtime_options(Some(&file), &env);
        assert_eq!(opts.root, PathBuf::from("/opt/bulwark"));
    }

    #[test]
    fn allow_self_update_truthy_values() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            let env = env_map(&[("BULWARK_ALLOW_SELF_UPDATE", v)]);
            assert!(build_runtime_options(None, &env).allow_self_update, "{v}");
        }
        let env = env_map(&[("BULWARK_ALLOW_SELF_UPDATE", "0")]);
        assert!(!build_runtime_options(None, &env).allow_self_update);
    }

    #[test]
    fn webhook_env_locks_are_detected() {
        let env = env_map(&[("DISCORD_WEBHOOK_URL", "https://discord.example/hook")]);
        let locks = webhook_locks(&env);
        assert!(locks.discord_locked);
        assert!(!locks.slack_locked);
    }

    #[test]
    fn file_config_roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulwark.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "allow_self_update = true").unwrap();
        writeln!(f, "lock_timeout = \"45s\"").unwrap();
        drop(f);

        let loaded = FileConfig::load_from_root(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.allow_self_update, Some(true));
        assert_eq!(loaded.lock_timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn load_from_root_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileConfig::load_from_root(dir.path()).unwrap().is_none());
    }

    #[test]
    fn parses_cpuset_docker_entry() {
        let content = "/docker/abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789\n";
        assert_eq!(
            parse_cpuset(content).as_deref(),
            Some("abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789")
        );
    }

    #[test]
    fn parses_cpuset_root_entry_as_none() {
        assert_eq!(parse_cpuset("/\n"), None);
    }

    #[test]
    fn self_container_id_prefers_explicit_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuset");
        fs::write(&path, "/docker/abcdef0123456789abcdef0123456789abcdef0123456789\n").unwrap();

        let explicit = Some("explicit-id".to_string());
        assert_eq!(
            self_container_id_from(&explicit, &path).as_deref(),
            Some("explicit-id")
        );
    }

    #[test]
    fn self_container_id_falls_back_to_cpuset_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuset");
        fs::write(&path, "/docker/abcdef0123456789abcdef0123456789abcdef0123456789\n").unwrap();

        assert_eq!(
            self_container_id_from(&None, &path).as_deref(),
            Some("abcdef0123456789abcdef0123456789abcdef0123456789")
        );
    }

    #[test]
    fn probe_config_ignored_when_none_variant() {
        // Sanity: bulwark-config doesn't interpret ProbeConfig itself, just
        // carries ProbeDefaults; this exercises the re-exported type still
        // links against bulwark-types correctly.
        assert!(ProbeConfig::None.is_none());
    }
}
