//! Kubernetes resource quantity parsing and per-resource arithmetic.
//!
//! Quantities arrive as canonical strings ("100m", "1Gi", "2") from node
//! allocatable, pod requests, and configuration. Capacity arithmetic is done
//! on f64 values, which is precise enough for spare-capacity sizing.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{ExecutorError, Result};

// Two-character suffixes must be matched before single-character ones.
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a canonical Kubernetes quantity string into a scalar value.
pub fn parse_quantity(input: &str) -> Result<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ExecutorError::InvalidQuantity(input.to_string()));
    }

    // Plain numbers, including exponent notation ("1e3"), parse directly.
    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(value);
    }

    for (suffix, base) in SUFFIXES {
        if let Some(number) = trimmed.strip_suffix(suffix) {
            let value: f64 = number
                .parse()
                .map_err(|_| ExecutorError::InvalidQuantity(input.to_string()))?;
            return Ok(value * base);
        }
    }

    Err(ExecutorError::InvalidQuantity(input.to_string()))
}

/// Format a scalar back into a quantity string. Sub-unit values use the milli
/// suffix so cpu requests round-trip without losing precision.
pub fn format_quantity(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}m", (value * 1000.0).round() as i64)
    }
}

/// Per-resource scalar map ("cpu", "memory", ...) with the arithmetic the
/// capacity and utilisation paths need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeResources(BTreeMap<String, f64>);

impl ComputeResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a map of `Quantity` values, skipping entries that fail to
    /// parse (malformed quantities on cluster objects are not actionable here).
    pub fn from_quantity_map(map: &BTreeMap<String, Quantity>) -> Self {
        let mut resources = Self::new();
        for (name, quantity) in map {
            if let Ok(value) = parse_quantity(&quantity.0) {
                resources.add_value(name, value);
            }
        }
        resources
    }

    /// Build from configuration-style string quantities.
    pub fn from_string_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut resources = Self::new();
        for (name, quantity) in map {
            resources.add_value(name, parse_quantity(quantity)?);
        }
        Ok(resources)
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn add_value(&mut self, name: &str, value: f64) {
        *self.0.entry(name.to_string()).or_insert(0.0) += value;
    }

    pub fn add(&mut self, other: &ComputeResources) {
        for (name, value) in &other.0 {
            self.add_value(name, *value);
        }
    }

    /// Subtract, keeping resource names from both sides so a deficit shows up
    /// as a negative entry rather than disappearing.
    pub fn sub(&self, other: &ComputeResources) -> ComputeResources {
        let mut result = self.clone();
        for (name, value) in &other.0 {
            *result.0.entry(name.clone()).or_insert(0.0) -= value;
        }
        result
    }

    pub fn max_with(&self, other: &ComputeResources) -> ComputeResources {
        let mut result = self.clone();
        for (name, value) in &other.0 {
            let entry = result.0.entry(name.clone()).or_insert(0.0);
            if *value > *entry {
                *entry = *value;
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every tracked resource is strictly positive.
    pub fn all_positive(&self) -> bool {
        !self.0.is_empty() && self.0.values().all(|v| *v > 0.0)
    }

    /// True when this holds at least `minimum` in every dimension `minimum`
    /// tracks.
    pub fn covers(&self, minimum: &ComputeResources) -> bool {
        minimum.0.iter().all(|(name, value)| self.get(name) >= *value)
    }

    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), format_quantity(*value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}
