//! Capability tokens and the predicate engine that gates tests on them.
//!
//! A target declares a fixed set of capability tokens (`core:upload`,
//! `core:list`, `ext:acme/mirror`, ...). A test declares the tokens it
//! requires. The predicate is plain set containment: exact, case-sensitive
//! string comparison, with an empty requirement vacuously satisfied.
//!
//! Tokens under [`EXTENSION_PREFIX`] are vendor extensions. They are matched
//! exactly like any other token and never inspected further.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix reserved for open-ended vendor extension tokens.
pub const EXTENSION_PREFIX: &str = "ext:";

/// Environment variable carrying the declared capability set to test bodies.
pub const CAPABILITIES_ENV: &str = "BLOBCHECK_CAPABILITIES";

/// A single namespaced capability token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(token: impl Into<String>) -> Self {
        Capability(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this token belongs to the vendor extension family.
    pub fn is_extension(&self) -> bool {
        self.0.starts_with(EXTENSION_PREFIX)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability(s.to_string())
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability(s)
    }
}

/// The capabilities a target declares. Fixed once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Capability>,
    {
        CapabilitySet(tokens.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.0.contains(cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined form exported to the test runner environment.
    pub fn to_env_value(&self) -> String {
        self.0
            .iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the comma-joined environment form. Empty segments are dropped.
    pub fn from_env_value(raw: &str) -> Self {
        CapabilitySet::new(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }

    /// Read the set exported by the harness into a test process.
    ///
    /// Returns `None` when the variable is absent, i.e. the process was not
    /// launched by the harness.
    pub fn from_env() -> Option<Self> {
        std::env::var(CAPABILITIES_ENV)
            .ok()
            .map(|raw| Self::from_env_value(&raw))
    }
}

/// Ordered list of tokens a test needs before it may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirement(Vec<Capability>);

/// Build a requirement from a list of tokens.
///
/// ```
/// use blobcheck_core::capability::{requires, CapabilitySet};
///
/// let declared = CapabilitySet::new(["core:health", "core:upload"]);
/// assert!(requires(["core:upload"]).is_satisfied_by(&declared));
/// assert!(!requires(["core:upload", "core:download"]).is_satisfied_by(&declared));
/// ```
pub fn requires<I, T>(tokens: I) -> Requirement
where
    I: IntoIterator<Item = T>,
    T: Into<Capability>,
{
    Requirement(tokens.into_iter().map(Into::into).collect())
}

impl Requirement {
    /// True iff every required token is declared.
    pub fn is_satisfied_by(&self, declared: &CapabilitySet) -> bool {
        self.0.iter().all(|cap| declared.contains(cap))
    }

    /// Required tokens absent from `declared`, in declaration order.
    pub fn missing<'a>(&'a self, declared: &CapabilitySet) -> Vec<&'a Capability> {
        self.0.iter().filter(|cap| !declared.contains(cap)).collect()
    }

    pub fn tokens(&self) -> &[Capability] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Turn the requirement into a reusable predicate over declared sets.
    pub fn predicate(&self) -> impl Fn(&CapabilitySet) -> bool + '_ {
        move |declared| self.is_satisfied_by(declared)
    }
}

/// One entry of the conformance test catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Stable test id, `suite::name` as produced by the result extractor.
    pub id: String,

    /// Tokens the test requires.
    #[serde(default)]
    pub requires: Requirement,
}

/// A catalog test that cannot run against the current target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatedTest {
    pub id: String,
    pub requires: Requirement,
    pub missing: Vec<Capability>,
}

impl GatedTest {
    pub fn skip_reason(&self) -> String {
        let missing: Vec<&str> = self.missing.iter().map(Capability::as_str).collect();
        format!("missing capabilities: {}", missing.join(", "))
    }
}

/// Split of the catalog into runnable and gated tests for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatePlan {
    pub enabled: Vec<String>,
    pub gated: Vec<GatedTest>,
}

impl GatePlan {
    pub fn evaluate(catalog: &[CatalogEntry], declared: &CapabilitySet) -> Self {
        let mut plan = GatePlan::default();
        for entry in catalog {
            if entry.requires.is_satisfied_by(declared) {
                plan.enabled.push(entry.id.clone());
            } else {
                plan.gated.push(GatedTest {
                    id: entry.id.clone(),
                    requires: entry.requires.clone(),
                    missing: entry
                        .requires
                        .missing(declared)
                        .into_iter()
                        .cloned()
                        .collect(),
                });
            }
        }
        plan
    }

    /// Comma-joined gated ids exported to the test runner.
    pub fn gated_env_value(&self) -> String {
        self.gated
            .iter()
            .map(|g| g.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> CapabilitySet {
        CapabilitySet::new(["core:health", "core:upload"])
    }

    #[test]
    fn test_empty_requirement_is_vacuously_true() {
        assert!(requires(Vec::<String>::new()).is_satisfied_by(&declared()));
        assert!(requires(Vec::<String>::new()).is_satisfied_by(&CapabilitySet::default()));
    }

    #[test]
    fn test_subset_is_satisfied() {
        assert!(requires(["core:upload"]).is_satisfied_by(&declared()));
        assert!(requires(["core:health", "core:upload"]).is_satisfied_by(&declared()));
    }

    #[test]
    fn test_missing_token_fails() {
        let req = requires(["core:upload", "core:download"]);
        assert!(!req.is_satisfied_by(&declared()));
        let missing = req.missing(&declared());
        assert_eq!(missing, vec![&Capability::from("core:download")]);
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        assert!(!requires(["Core:Upload"]).is_satisfied_by(&declared()));
    }

    #[test]
    fn test_extension_tokens_are_opaque() {
        let set = CapabilitySet::new(["ext:acme/mirror"]);
        assert!(requires(["ext:acme/mirror"]).is_satisfied_by(&set));
        assert!(!requires(["ext:acme"]).is_satisfied_by(&set));
        assert!(Capability::from("ext:acme/mirror").is_extension());
        assert!(!Capability::from("core:upload").is_extension());
    }

    #[test]
    fn test_predicate_does_not_mutate_declared_set() {
        let set = declared();
        let before = set.clone();
        let req = requires(["core:list"]);
        let pred = req.predicate();
        assert!(!pred(&set));
        assert_eq!(set, before);
    }

    #[test]
    fn test_env_value_parsing() {
        let set = CapabilitySet::from_env_value("core:upload, core:health,,");
        assert_eq!(set, declared());
        assert_eq!(set.to_env_value(), "core:health,core:upload");
    }

    #[test]
    fn test_gate_plan_splits_catalog() {
        let catalog = vec![
            CatalogEntry {
                id: "upload::put_blob".to_string(),
                requires: requires(["core:upload"]),
            },
            CatalogEntry {
                id: "download::get_blob".to_string(),
                requires: requires(["core:upload", "core:download"]),
            },
            CatalogEntry {
                id: "health::ping".to_string(),
                requires: Requirement::default(),
            },
        ];
        let plan = GatePlan::evaluate(&catalog, &declared());
        assert_eq!(plan.enabled, vec!["upload::put_blob", "health::ping"]);
        assert_eq!(plan.gated.len(), 1);
        assert_eq!(plan.gated[0].id, "download::get_blob");
        assert_eq!(
            plan.gated[0].skip_reason(),
            "missing capabilities: core:download"
        );
        assert_eq!(plan.gated_env_value(), "download::get_blob");
    }
}
