//! Scheduled notification dispatch. The manager re-runs the planner
//! on every tick, reduces the plan to the services with an available
//! update, and pushes a message to whichever sinks are enabled. Immediate
//! mode dedupes against the last fingerprint it sent; digest mode always
//! sends when there's something to report.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_config::{Reporter, RuntimeOptions, WebhookLocks};
use bulwark_plan::Planner;
use bulwark_retry::{Cancellation, RetryConfig, http_status_is_retryable, retry_with};
use bulwark_store::Store;
use bulwark_types::PlanItem;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const SETTINGS_KEY: &str = "notify.settings";
const LAST_HASH_KEY: &str = "notify.last_hash";
const MAX_LISTED_ITEMS: usize = 20;

/// Persisted notification configuration (distinct from [`RuntimeOptions`],
/// which is process-lifetime; this is edited through the API surface and
/// survives restarts via the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub discord_webhook: Option<String>,
    pub slack_webhook: Option<String>,
    pub discord_enabled: bool,
    pub slack_enabled: bool,
    /// Immediate-on-find mode: check on `check_cron`, send only when the
    /// set of updatable services changed since the last send.
    pub notify_on_find: bool,
    /// Digest mode: send an unconditional summary on `digest_cron` whenever
    /// at least one update is available.
    pub digest_enabled: bool,
    pub check_cron: String,
    pub digest_cron: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discord_webhook: None,
            slack_webhook: None,
            discord_enabled: false,
            slack_enabled: false,
            notify_on_find: true,
            digest_enabled: false,
            check_cron: "*/15 * * * *".to_string(),
            digest_cron: "0 8 * * *".to_string(),
        }
    }
}

pub struct NotificationManager {
    store: Arc<dyn Store>,
    http: reqwest::blocking::Client,
    settings: Mutex<Settings>,
    webhook_locks: WebhookLocks,
    env_discord_webhook: Option<String>,
    env_slack_webhook: Option<String>,
}

impl NotificationManager {
    pub fn new(store: Arc<dyn Store>, opts: &RuntimeOptions, webhook_locks: WebhookLocks) -> Result<Self> {
        let settings = load_settings(store.as_ref())?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building notification http client")?;
        Ok(Self {
            store,
            http,
            settings: Mutex::new(settings),
            webhook_locks,
            env_discord_webhook: opts.discord_webhook.clone(),
            env_slack_webhook: opts.slack_webhook.clone(),
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().expect("notify settings poisoned").clone()
    }

    /// Replaces the persisted settings. A locked field's stored value is
    /// still accepted (so the API round-trips), but `effective_*_webhook`
    /// always prefers the environment override while it's locked.
    pub fn update_settings(&self, new_settings: Settings) -> Result<()> {
        self.store.set_setting(SETTINGS_KEY, &serde_json::to_string(&new_settings)?)?;
        *self.settings.lock().expect("notify settings poisoned") = new_settings;
        Ok(())
    }

    fn effective_discord_webhook(&self) -> Option<String> {
        if self.webhook_locks.discord_locked {
            self.env_discord_webhook.clone()
        } else {
            self.settings().discord_webhook
        }
    }

    fn effective_slack_webhook(&self) -> Option<String> {
        if self.webhook_locks.slack_locked {
            self.env_slack_webhook.clone()
        } else {
            self.settings().slack_webhook
        }
    }

    /// Runs one immediate-mode tick: builds the plan, and sends only if the
    /// fingerprint of available updates differs from the last send.
    /// Returns whether a notification was actually dispatched.
    pub fn check_on_find(
        &self,
        planner: &Planner,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<bool> {
        if !self.settings().notify_on_find {
            return Ok(false);
        }
        let items = self.updatable_items(planner, cancel, reporter)?;
        if items.is_empty() {
            return Ok(false);
        }

        let fingerprint = compute_fingerprint(&items);
        let last = self.store.get_setting(LAST_HASH_KEY)?;
        if last.as_deref() == Some(fingerprint.as_str()) {
            return Ok(false);
        }

        self.dispatch(&items, false, cancel, reporter)?;
        self.store.set_setting(LAST_HASH_KEY, &fingerprint)?;
        Ok(true)
    }

    /// Runs one digest-mode tick: always sends a summary when updates are
    /// available, regardless of what was sent before.
    pub fn send_digest(
        &self,
        planner: &Planner,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<bool> {
        if !self.settings().digest_enabled {
            return Ok(false);
        }
        let items = self.updatable_items(planner, cancel, reporter)?;
        if items.is_empty() {
            return Ok(false);
        }
        self.dispatch(&items, true, cancel, reporter)?;
        Ok(true)
    }

    fn updatable_items(
        &self,
        planner: &Planner,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<PlanItem>> {
        let plan = planner.plan(None, false, cancel, reporter)?;
        Ok(plan.items.into_iter().filter(|i| i.update_available).collect())
    }

    fn dispatch(
        &self,
        items: &[PlanItem],
        digest: bool,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let settings = self.settings();
        let message = build_message(items, digest);

        if settings.discord_enabled
            && let Some(url) = self.effective_discord_webhook()
        {
            let body = serde_json::json!({ "content": message });
            self.send_with_retry(&url, &body, cancel, reporter)?;
        }
        if settings.slack_enabled
            && let Some(url) = self.effective_slack_webhook()
        {
            let body = serde_json::json!({ "text": message });
            self.send_with_retry(&url, &body, cancel, reporter)?;
        }
        Ok(())
    }

    fn send_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
        cancel: &Cancellation,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let config = RetryConfig::notification();
        let result = retry_with(&config, cancel, |attempt| -> Result<()> {
            let resp = self
                .http
                .post(url)
                .json(body)
                .send()
                .with_context(|| format!("notification post attempt {attempt}"))?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            if http_status_is_retryable(status.as_u16()) {
                anyhow::bail!("notification sink returned retryable status {status}");
            }
            // Non-retryable 4xx: don't keep hammering the sink, but don't
            // mask the failure either.
            reporter.warn(&format!("notification sink rejected payload (status {status}), not retrying"));
            Ok(())
        });
        if let Err(e) = &result {
            reporter.error(&format!("notification delivery failed: {e:#}"));
        }
        result
    }
}

fn load_settings(store: &dyn Store) -> Result<Settings> {
    match store.get_setting(SETTINGS_KEY)? {
        Some(raw) => serde_json::from_str(&raw).context("corrupt notify settings"),
        None => Ok(Settings::default()),
    }
}

fn compute_fingerprint(items: &[PlanItem]) -> String {
    let mut tuples: Vec<String> = items
        .iter()
        .map(|i| format!("{}:{}:{}", i.target_id, i.service_id, i.remote_digest.as_deref().unwrap_or("")))
        .collect();
    tuples.sort();
    let mut hasher = Sha256::new();
    hasher.update(tuples.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

fn build_message(items: &[PlanItem], digest: bool) -> String {
    let header = if digest {
        format!("bulwark digest: {} update(s) available", items.len())
    } else {
        format!("bulwark: {} new update(s) available", items.len())
    };

    let mut lines = vec![header];
    for item in items.iter().take(MAX_LISTED_ITEMS) {
        lines.push(format!(
            "- {} ({} -> {})",
            item.service_name,
            short_digest(&item.current_digest),
            item.remote_digest.as_deref().map(short_digest).unwrap_or_else(|| "?".to_string())
        ));
    }
    if items.len() > MAX_LISTED_ITEMS {
        lines.push(format!("and {} more", items.len() - MAX_LISTED_ITEMS));
    }
    lines.join("\n")
}

fn short_digest(digest: &str) -> String {
    bulwark_types::strip_digest_prefix(digest).chars().take(12).collect()
}
