//! Import policy seam.
//!
//! The manager asks the injected engine whether (and in what shape) an
//! entry may enter an area. Implementations range from the identity
//! policy to the ordered-rule matcher below.

use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};

use trellis_model::{PrefixEntry, PrefixMetrics, PrefixType};

/// Outcome of applying one policy: the (possibly rewritten) entry or a
/// rejection, plus the name of the rule that decided.
pub type PolicyResult = (Option<PrefixEntry>, String);

pub trait PolicyEngine: Send + Sync {
    fn has_policy(&self, policy: &str) -> bool;

    fn apply_policy(&self, policy: &str, entry: &PrefixEntry) -> PolicyResult;
}

/// Accepts everything unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPolicy;

impl PolicyEngine for NoopPolicy {
    fn has_policy(&self, _policy: &str) -> bool {
        true
    }

    fn apply_policy(&self, _policy: &str, entry: &PrefixEntry) -> PolicyResult {
        (Some(entry.clone()), "default-accept".to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    Accept {
        set_path_preference: Option<i32>,
        set_source_preference: Option<i32>,
    },
    Reject,
}

impl PolicyAction {
    pub fn accept() -> Self {
        PolicyAction::Accept {
            set_path_preference: None,
            set_source_preference: None,
        }
    }
}

/// One ordered rule: empty match axes are wildcards.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub name: String,
    /// Match entries whose prefix falls inside any of these.
    pub match_prefixes: Vec<IpNet>,
    pub match_tags: BTreeSet<String>,
    pub match_types: BTreeSet<PrefixType>,
    pub action: PolicyAction,
}

impl PolicyRule {
    fn matches(&self, entry: &PrefixEntry) -> bool {
        let prefix_ok = self.match_prefixes.is_empty()
            || self.match_prefixes.iter().any(|p| p.contains(&entry.prefix));
        let tags_ok = self.match_tags.is_empty()
            || self.match_tags.iter().any(|t| entry.tags.contains(t));
        let type_ok = self.match_types.is_empty() || self.match_types.contains(&entry.ptype);
        prefix_ok && tags_ok && type_ok
    }
}

/// First-match rule evaluation; entries matching no rule are rejected.
#[derive(Clone, Debug, Default)]
pub struct RulePolicy {
    policies: HashMap<String, Vec<PolicyRule>>,
}

impl RulePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        self.policies.insert(name.into(), rules);
        self
    }
}

impl PolicyEngine for RulePolicy {
    fn has_policy(&self, policy: &str) -> bool {
        self.policies.contains_key(policy)
    }

    fn apply_policy(&self, policy: &str, entry: &PrefixEntry) -> PolicyResult {
        let Some(rules) = self.policies.get(policy) else {
            return (None, "unknown-policy".to_string());
        };
        for rule in rules {
            if !rule.matches(entry) {
                continue;
            }
            return match &rule.action {
                PolicyAction::Reject => (None, rule.name.clone()),
                PolicyAction::Accept {
                    set_path_preference,
                    set_source_preference,
                } => {
                    let mut out = entry.clone();
                    out.metrics = PrefixMetrics {
                        path_preference: set_path_preference
                            .unwrap_or(out.metrics.path_preference),
                        source_preference: set_source_preference
                            .unwrap_or(out.metrics.source_preference),
                        distance: out.metrics.distance,
                    };
                    (Some(out), rule.name.clone())
                }
            };
        }
        (None, "implicit-reject".to_string())
    }
}
