//! Translates the `bulwark.*` label vocabulary into typed
//! `Labels`/`ProbeConfig`. Never hard-fails on a malformed label: bad
//! values fall back to documented defaults and accumulate warnings instead,
//! since a container that merely has sloppy labels should still be
//! discoverable and plannable.

use std::collections::BTreeMap;

use bulwark_types::{Definition, Labels, Policy, ProbeConfig, Tier};

/// Substrings of an image repository that imply a stateful workload when
/// the operator hasn't set `bulwark.tier` explicitly.
const KNOWN_DATABASE_KEYWORDS: &[&str] = &[
    "postgres",
    "mysql",
    "mariadb",
    "mongo",
    "redis",
    "elasticsearch",
    "cassandra",
    "couchdb",
    "influxdb",
    "clickhouse",
    "cockroach",
    "memcached",
    "rabbitmq",
    "timescaledb",
    "neo4j",
    "etcd",
];

/// Accepts the label encoding either as a ready-made map or as a
/// `KEY=VALUE` array (the shape container runtimes commonly expose
/// labels in), normalizing to the map form label lookups use.
pub fn normalize_labels(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The result of parsing one service's labels: the typed config plus any
/// non-fatal warnings accumulated along the way.
#[derive(Debug, Clone, Default)]
pub struct ParsedLabels {
    pub labels: Labels,
    pub warnings: Vec<String>,
}

/// Parses a label map into typed `Labels`, applying database-keyword tier
/// inference when `bulwark.tier` is absent, and validating probe
/// configuration.
pub fn parse_labels(image: &str, raw: &BTreeMap<String, String>) -> ParsedLabels {
    let mut warnings = Vec::new();

    let enabled = raw
        .get("bulwark.enabled")
        .map(|v| parse_bool(v))
        .unwrap_or(false);

    let policy = match raw.get("bulwark.policy").map(String::as_str) {
        None => Policy::Safe,
        Some("notify") => Policy::Notify,
        Some("safe") => Policy::Safe,
        Some("aggressive") => Policy::Aggressive,
        Some(other) => {
            warnings.push(format!("unknown bulwark.policy {other:?}, defaulting to safe"));
            Policy::Safe
        }
    };

    let explicit_tier = raw.get("bulwark.tier").map(String::as_str);
    let tier = match explicit_tier {
        Some("stateless") => Tier::Stateless,
        Some("stateful") => Tier::Stateful,
        Some(other) => {
            warnings.push(format!("unknown bulwark.tier {other:?}, defaulting to stateless"));
            Tier::Stateless
        }
        None => {
            if is_known_database_image(image) {
                Tier::Stateful
            } else {
                Tier::Stateless
            }
        }
    };

    let definition = raw.get("bulwark.definition").and_then(|raw_def| {
        match Definition::parse(raw_def) {
            Ok(d) => Some(d),
            Err(e) => {
                warnings.push(format!("invalid bulwark.definition {raw_def:?}: {e}"));
                None
            }
        }
    });

    let probe = parse_probe(raw, &mut warnings);

    if policy == Policy::Safe && probe.is_none() {
        warnings.push("safe policy with no probe configured; updates will not be verified".into());
    }
    if policy == Policy::Aggressive && tier == Tier::Stateful {
        warnings.push("aggressive policy applied to a stateful service".into());
    }

    ParsedLabels {
        labels: Labels {
            enabled,
            policy,
            tier,
            definition,
            probe,
        },
        warnings,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn is_known_database_image(image: &str) -> bool {
    let lower = image.to_ascii_lowercase();
    KNOWN_DATABASE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn parse_probe(raw: &BTreeMap<String, String>, warnings: &mut Vec<String>) -> ProbeConfig {
    match raw.get("bulwark.probe.type").map(String::as_str) {
        None | Some("none") => ProbeConfig::None,
        Some("docker") => ProbeConfig::Docker,
        Some("http") => {
            let url = raw.get("bulwark.probe.url").cloned();
            let expect_status = raw
                .get("bulwark.probe.expect_status")
                .and_then(|s| s.parse().ok())
                .unwrap_or(200);
            match url {
                Some(url) => ProbeConfig::Http { url, expect_status },
                None => {
                    warnings.push("http probe configured but bulwark.probe.url is missing".into());
                    ProbeConfig::None
                }
            }
        }
        Some("tcp") => {
            let host = raw.get("bulwark.probe.tcp_host").cloned();
            let port = raw.get("bulwark.probe.tcp_port").and_then(|s| s.parse().ok());
            match (host, port) {
                (Some(host), Some(port)) => ProbeConfig::Tcp { host, port },
                _ => {
                    warnings.push(
                        "tcp probe configured but bulwark.probe.tcp_host/tcp_port is missing or invalid"
                            .into(),
                    );
                    ProbeConfig::None
                }
            }
        }
        Some("log") => {
            let pattern = raw.get("bulwark.probe.log_pattern").cloned();
            let window_sec = raw
                .get("bulwark.probe.window_sec")
                .and_then(|s| s.parse().ok())
                .unwrap_or(30);
            match pattern {
                Some(pattern) => ProbeConfig::Log { pattern, window_sec },
                None => {
                    warnings.push("log probe configured but bulwark.probe.log_pattern is missing".into());
                    ProbeConfig::None
                }
            }
        }
        Some("stability") => {
            let duration_sec = raw
                .get("bulwark.probe.stability_sec")
                .and_then(|s| s.parse().ok())
                .unwrap_or(10);
            ProbeConfig::Stability { duration_sec }
        }
        Some(other) => {
            warnings.push(format!("unknown bulwark.probe.type {other:?}, treating as none"));
            ProbeConfig::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn disabled_by_default() {
        let parsed = parse_labels("nginx", &labels(&[]));
        assert!(!parsed.labels.enabled);
        assert_eq!(parsed.labels.policy, Policy::Safe);
        assert_eq!(parsed.labels.tier, Tier::Stateless);
    }

    #[test]
    fn unknown_policy_falls_back_to_safe_with_warning() {
        let parsed = parse_labels("nginx", &labels(&[("bulwark.policy", "yolo")]));
        assert_eq!(parsed.labels.policy, Policy::Safe);
        assert!(parsed.warnings.iter().any(|w| w.contains("unknown bulwark.policy")));
    }

    #[test]
    fn database_image_infers_stateful_tier() {
        let parsed = parse_labels("postgres:16", &labels(&[]));
        assert_eq!(parsed.labels.tier, Tier::Stateful);
    }

    #[test]
    fn explicit_tier_wins_over_database_inference() {
        let parsed = parse_labels("postgres:16", &labels(&[("bulwark.tier", "stateless")]));
        assert_eq!(parsed.labels.tier, Tier::Stateless);
    }

    #[test]
    fn http_probe_parses_fields() {
        let parsed = parse_labels(
            "nginx",
            &labels(&[
                ("bulwark.probe.type", "http"),
                ("bulwark.probe.url", "http://svc/health"),
                ("bulwark.probe.expect_status", "204"),
            ]),
        );
        match parsed.labels.probe {
            ProbeConfig::Http { url, expect_status } => {
                assert_eq!(url, "http://svc/health");
                assert_eq!(expect_status, 204);
            }
            other => panic!("expected http probe, got {other:?}"),
        }
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn http_probe_missing_url_warns_and_falls_back_to_none() {
        let parsed = parse_labels("nginx", &labels(&[("bulwark.probe.type", "http")]));
        assert!(parsed.labels.probe.is_none());
        assert!(parsed.warnings.iter().any(|w| w.contains("missing")));
    }

    #[test]
    fn safe_policy_without_probe_warns() {
        let parsed = parse_labels("nginx", &labels(&[("bulwark.policy", "safe")]));
        assert!(parsed.warnings.iter().any(|w| w.contains("no probe")));
    }

    #[test]
    fn aggressive_on_stateful_warns() {
        let parsed = parse_labels(
            "postgres:16",
            &labels(&[("bulwark.policy", "aggressive")]),
        );
        assert!(parsed.warnings.iter().any(|w| w.contains("stateful")));
    }

    #[test]
    fn normalizes_key_value_array() {
        let raw = vec!["bulwark.enabled=true".to_string(), "bulwark.policy=notify".to_string()];
        let map = normalize_labels(&raw);
        assert_eq!(map.get("bulwark.enabled").map(String::as_str), Some("true"));
        let parsed = parse_labels("nginx", &map);
        assert!(parsed.labels.enabled);
        assert_eq!(parsed.labels.policy, Policy::Notify);
    }

    #[test]
    fn invalid_definition_warns_and_is_dropped() {
        let parsed = parse_labels("nginx", &labels(&[("bulwark.definition", "not-a-definition")]));
        assert!(parsed.labels.definition.is_none());
        assert!(parsed.warnings.iter().any(|w| w.contains("invalid bulwark.definition")));
    }
}
