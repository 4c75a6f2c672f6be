//! Docker Registry v2 client: anonymous-then-bearer manifest digest
//! resolution. Talks HTTP directly rather than through a registry
//! SDK, matching this codebase's preference for a small `reqwest`-backed
//! client over a generic "API client" abstraction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bulwark_types::ImageRef;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use serde::Deserialize;

const MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

const LIST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// `<registry>/<repository>` keyed, write-once-per-key bearer token cache.
/// Concurrent fills racing on the same key are harmless because tokens are
/// idempotent — whichever write lands last simply overwrites an equally
/// valid token, so this is a plain mutex rather than a more elaborate
/// single-flight structure.
#[derive(Debug, Clone, Default)]
pub struct TokenCache(Arc<Mutex<HashMap<String, String>>>);

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().expect("token cache poisoned").get(key).cloned()
    }

    fn put(&self, key: &str, token: &str) {
        self.0
            .lock()
            .expect("token cache poisoned")
            .insert(key.to_string(), token.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    tokens: TokenCache,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        Self::with_token_cache(TokenCache::new())
    }

    pub fn with_token_cache(tokens: TokenCache) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("bulwark/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self { http, tokens })
    }

    /// Fetches the `sha256:`-prefixed digest of the platform-specific image
    /// the registry would deliver to a `linux/amd64` puller.
    pub fn fetch_digest(&self, image: &str) -> Result<String> {
        let image_ref = ImageRef::parse(image).with_context(|| format!("parsing image {image:?}"))?;
        let host = image_ref.registry_host();
        let manifest_url = format!(
            "https://{host}/v2/{}/manifests/{}",
            image_ref.repository,
            image_ref.manifest_reference()
        );

        let cache_key = format!("{}/{}", image_ref.registry, image_ref.repository);

        let token = self.tokens.get(&cache_key);
        let resp = self.get_manifest(&manifest_url, token.as_deref())?;

        let resp = if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = parse_www_authenticate(
                resp.headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(""),
            )
            .with_context(|| format!("registry {host} returned 401 without a usable challenge"))?;

            let scope = challenge
                .scope
                .clone()
                .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));
            let token = self.negotiate_token(&challenge.realm, challenge.service.as_deref(), &scope)?;
            self.tokens.put(&cache_key, &token);

            let retried = self.get_manifest(&manifest_url, Some(&token))?;
            if !retried.status().is_success() {
                bail!(
                    "registry manifest request failed with status {} after bearer retry",
                    retried.status()
                );
            }
            retried
        } else if !resp.status().is_success() {
            bail!("registry manifest request failed with status {}", resp.status());
        } else {
            resp
        };

        digest_from_response(resp)
    }

    fn get_manifest(&self, url: &str, token: Option<&str>) -> Result<Response> {
        let mut req = self.http.get(url).header(ACCEPT, MEDIA_TYPES.join(", "));
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req.send().context("registry manifest request failed")
    }

    fn negotiate_token(&self, realm: &str, service: Option<&str>, scope: &str) -> Result<String> {
        let mut req = self.http.get(realm).query(&[("scope", scope)]);
        if let Some(service) = service {
            req = req.query(&[("service", service)]);
        }
        let resp = req.send().context("token negotiation request failed")?;
        if !resp.status().is_success() {
            bail!("token negotiation failed with status {}", resp.status());
        }
        let body: TokenResponse = resp.json().context("failed to parse token response")?;
        body.token
            .or(body.access_token)
            .context("token response had neither `token` nor `access_token`")
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new().expect("failed to build default registry client")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parses a `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
/// header value.
fn parse_www_authenticate(header: &str) -> Result<BearerChallenge> {
    let rest = header
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| header.trim().strip_prefix("bearer "))
        .context("WWW-Authenticate header is not a Bearer challenge")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for part in split_challenge_params(rest) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Ok(BearerChallenge {
        realm: realm.context("Bearer challenge missing realm")?,
        service,
        scope,
    })
}

/// Splits on commas that are not inside a quoted value.
fn split_challenge_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

#[derive(Debug, Deserialize)]
struct ManifestListEntry {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    os: String,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct ManifestList {
    manifests: Vec<ManifestListEntry>,
}

#[derive(Debug, Deserialize)]
struct SingleManifest {
    config: ConfigDescriptor,
}

#[derive(Debug, Deserialize)]
struct ConfigDescriptor {
    digest: String,
}

fn digest_from_response(resp: Response) -> Result<String> {
    let header_digest = resp
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();

    let is_list = LIST_MEDIA_TYPES.iter().any(|mt| content_type.starts_with(mt));

    let body = resp.text().context("failed to read manifest response body")?;

    if is_list {
        if let Some(d) = header_digest {
            return Ok(d);
        }
        let list: ManifestList =
            serde_json::from_str(&body).context("failed to parse manifest list JSON")?;
        return pick_platform_digest(&list).context("no digest found in manifest");
    }

    if let Some(d) = header_digest {
        return Ok(d);
    }

    let manifest: SingleManifest =
        serde_json::from_str(&body).context("failed to parse manifest JSON")?;
    if manifest.config.digest.is_empty() {
        bail!("no digest found in manifest");
    }
    Ok(manifest.config.digest)
}

fn pick_platform_digest(list: &ManifestList) -> Option<String> {
    if let Some(entry) = list.manifests.iter().find(|m| {
        m.platform
            .as_ref()
            .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
    }) {
        return Some(entry.digest.clone());
    }
    list.manifests.first().map(|m| m.digest.clone())
}
