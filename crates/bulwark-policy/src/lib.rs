//! Pure allow/deny and rollback decisions. No I/O, no retries —
//! every branch here is a straight read of `Labels`/`Policy`/`Tier`, which
//! is what keeps this crate worth unit-testing in isolation from the
//! planner and executor that call it.

use bulwark_config::Reporter;
use bulwark_types::{Policy, ProbeConfig, Tier, UpdateResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub policy: Policy,
    pub tier: Tier,
}

/// Evaluates whether a service update is allowed to proceed.
pub fn evaluate(
    enabled: bool,
    policy: Policy,
    tier: Tier,
    probe: &ProbeConfig,
    update_available: bool,
    reporter: &mut dyn Reporter,
) -> Decision {
    let deny = |reason: &str| Decision {
        allowed: false,
        reason: reason.to_string(),
        policy,
        tier,
    };

    if !enabled {
        return deny("not enabled");
    }
    if !update_available {
        return deny("no update available");
    }
    match policy {
        Policy::Notify => deny("notify only"),
        Policy::Safe if tier == Tier::Stateful => deny("safe policy blocks stateful"),
        Policy::Safe => {
            if matches!(probe, ProbeConfig::None) {
                reporter.warn("safe policy allowing update with no probe configured");
            }
            Decision { allowed: true, reason: "allowed".to_string(), policy, tier }
        }
        Policy::Aggressive => {
            if tier == Tier::Stateful {
                reporter.warn("aggressive policy allowing update against a stateful service");
            }
            Decision { allowed: true, reason: "allowed".to_string(), policy, tier }
        }
    }
}

/// Rollback is warranted iff the apply failed and hasn't already rolled
/// back (probe failures surface as `success=false` before this runs).
pub fn should_rollback(result: &UpdateResult) -> bool {
    !result.success && !result.rollback_performed
}
