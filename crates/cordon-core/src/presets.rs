//! Named, versioned policy bundles.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, SandboxError};
use crate::policy::Policy;
use crate::roots::RootSpec;

/// Bumped whenever a shipped preset changes meaning.
pub const PRESET_VERSION: u32 = 1;

pub const PURE_COMPUTE: &str = "pure_compute";
pub const COMPUTE_PLUS_MATH: &str = "compute_plus_math";
pub const COMPUTE_PLUS_HTTP: &str = "compute_plus_http";

const MATH_FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "sinh", "cosh", "tanh", "asinh",
    "acosh", "atanh", "exp", "log", "log10", "log2", "sqrt", "pow", "floor", "ceil", "trunc",
    "fabs", "fmod", "hypot", "degrees", "radians", "copysign", "isfinite", "isinf", "isnan",
    "factorial", "comb", "perm", "prod",
];

const MATH_CONSTANTS: &[&str] = &["pi", "e", "tau"];

const JSON_FUNCTIONS: &[&str] = &["loads", "dumps"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyPreset {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub policy: Policy,
    pub roots: Vec<RootSpec>,
}

#[derive(Serialize)]
struct Canonical<'a> {
    policy: &'a Policy,
    roots: &'a [RootSpec],
}

impl PolicyPreset {
    fn new(name: &str, description: &str, policy: Policy, roots: Vec<RootSpec>) -> Self {
        Self {
            name: name.to_string(),
            version: PRESET_VERSION,
            description: description.to_string(),
            policy,
            roots,
        }
    }

    /// SHA-256 over the canonical JSON of policy and roots, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        // Round-trip through Value so every map is key-sorted.
        let canonical = serde_json::to_value(Canonical {
            policy: &self.policy,
            roots: &self.roots,
        })
        .map_err(|e| SandboxError::Serialization(e.to_string()))?;
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Ok(hex::encode(digest))
    }
}

fn math_root() -> RootSpec {
    let spec = MATH_FUNCTIONS
        .iter()
        .fold(RootSpec::new("math", "math"), |spec, f| spec.allow_call(f));
    MATH_CONSTANTS.iter().fold(spec, |spec, c| spec.allow_value(c))
}

fn json_root() -> RootSpec {
    JSON_FUNCTIONS
        .iter()
        .fold(RootSpec::new("json", "json"), |spec, f| spec.allow_call(f))
}

fn with_roots(roots: &[RootSpec]) -> Policy {
    let mut policy = Policy::default();
    for root in roots {
        policy.allow_root_attrs(&root.name, root.attrs());
    }
    policy
}

/// Every shipped preset, keyed by name.
pub fn presets() -> BTreeMap<String, PolicyPreset> {
    let math = vec![math_root()];
    let json = vec![json_root()];
    [
        PolicyPreset::new(
            PURE_COMPUTE,
            "Pure computation with built-ins only.",
            Policy::default(),
            Vec::new(),
        ),
        PolicyPreset::new(
            COMPUTE_PLUS_MATH,
            "Computation plus a read-only math root.",
            with_roots(&math),
            math,
        ),
        PolicyPreset::new(
            COMPUTE_PLUS_HTTP,
            "Computation plus JSON helpers, meant to be paired with HTTP capabilities.",
            with_roots(&json),
            json,
        ),
    ]
    .into_iter()
    .map(|p| (p.name.clone(), p))
    .collect()
}

pub fn preset(name: &str) -> Result<PolicyPreset> {
    presets()
        .remove(name)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("unknown policy preset: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::RootCatalog;

    #[test]
    fn test_three_presets_shipped() {
        let all = presets();
        assert_eq!(
            all.keys().map(String::as_str).collect::<Vec<_>>(),
            [COMPUTE_PLUS_HTTP, COMPUTE_PLUS_MATH, PURE_COMPUTE]
        );
        assert!(all[PURE_COMPUTE].roots.is_empty());
        assert!(all[PURE_COMPUTE].policy.attr_allowlist.is_empty());
    }

    #[test]
    fn test_math_preset_allows_its_root() {
        let p = preset(COMPUTE_PLUS_MATH).unwrap();
        let allowed = &p.policy.attr_allowlist["math"];
        assert!(allowed.contains("sqrt"));
        assert!(allowed.contains("pi"));
        assert!(!allowed.contains("inf"));
        assert_eq!(allowed.len(), MATH_FUNCTIONS.len() + MATH_CONSTANTS.len());
        RootCatalog::builtin().instantiate(&p.roots[0]).unwrap();
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let math = preset(COMPUTE_PLUS_MATH).unwrap();
        let a = math.fingerprint().unwrap();
        assert_eq!(a, preset(COMPUTE_PLUS_MATH).unwrap().fingerprint().unwrap());
        assert_eq!(a.len(), 64);
        assert_ne!(a, preset(PURE_COMPUTE).unwrap().fingerprint().unwrap());

        let mut tweaked = math.clone();
        tweaked.policy.max_steps += 1;
        assert_ne!(a, tweaked.fingerprint().unwrap());
    }

    #[test]
    fn test_unknown_preset() {
        match preset("nope") {
            Err(SandboxError::InvalidConfig(msg)) => assert!(msg.contains("nope")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }
}
