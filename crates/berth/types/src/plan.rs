//! Plan catalogue: maps a purchased plan to the resources its container gets.
//!
//! Only the memory limit matters to provisioning. Unknown plans are an
//! error rather than a silent default so a server is never under- or
//! over-provisioned relative to what was paid for.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifier of a purchasable plan (as resolved by the payment provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container memory limit in the runtime's shorthand (`512m`, `2g`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryLimit(String);

impl MemoryLimit {
    pub fn parse(raw: &str) -> Result<Self, PlanError> {
        let raw = raw.trim().to_ascii_lowercase();
        if !raw.is_ascii() {
            return Err(PlanError::InvalidMemoryLimit(raw));
        }
        let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
        let valid_unit = matches!(unit, "b" | "k" | "m" | "g");
        let valid_digits = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
        if !valid_unit || !valid_digits || digits.parse::<u64>().map_or(true, |n| n == 0) {
            return Err(PlanError::InvalidMemoryLimit(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Limit in bytes, as container runtimes expect it on the wire.
    pub fn bytes(&self) -> u64 {
        let (digits, unit) = self.0.split_at(self.0.len() - 1);
        let n: u64 = digits.parse().unwrap_or(0);
        let scale: u64 = match unit {
            "k" => 1 << 10,
            "m" => 1 << 20,
            "g" => 1 << 30,
            _ => 1,
        };
        n.saturating_mul(scale)
    }
}

impl TryFrom<String> for MemoryLimit {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MemoryLimit> for String {
    fn from(limit: MemoryLimit) -> Self {
        limit.0
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resources granted by one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub memory_limit: MemoryLimit,

    /// Human-readable name shown to owners.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Errors raised while resolving plans.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("invalid memory limit: {0}")]
    InvalidMemoryLimit(String),
}

/// Static plan → resource table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanTable {
    plans: BTreeMap<PlanId, PlanSpec>,
}

impl PlanTable {
    pub fn empty() -> Self {
        Self {
            plans: BTreeMap::new(),
        }
    }

    pub fn with_plan(mut self, id: impl Into<String>, spec: PlanSpec) -> Self {
        self.plans.insert(PlanId::new(id), spec);
        self
    }

    pub fn resolve(&self, plan: &PlanId) -> Result<&PlanSpec, PlanError> {
        self.plans
            .get(plan)
            .ok_or_else(|| PlanError::UnknownPlan(plan.to_string()))
    }

    pub fn contains(&self, plan: &PlanId) -> bool {
        self.plans.contains_key(plan)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlanId, &PlanSpec)> {
        self.plans.iter()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        let plan = |limit: &str, name: &str| PlanSpec {
            memory_limit: MemoryLimit(limit.to_string()),
            display_name: Some(name.to_string()),
        };
        Self::empty()
            .with_plan("planA", plan("2g", "2GB Plan"))
            .with_plan("planB", plan("4g", "4GB Plan"))
            .with_plan("planC", plan("8g", "8GB Plan"))
    }
}
