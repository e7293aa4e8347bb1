//! Schema model for the managed cluster resource
//!
//! The configurable surface is a tree of typed fields ([`ClusterSpec`] and
//! its nested blocks) plus a [`registry::FieldRegistry`] describing how each
//! field diffs: its mutability class, owning sub-resource target, and
//! revert default. The diff engine walks the registry, not the structs, so
//! any hierarchical schema with a registry is diffed by the same mechanism.

mod cluster;
pub mod registry;
mod types;

pub use cluster::ClusterSpec;
pub use types::{
    IdentitySpec, KeyManagementSpec, KeyVaultNetworkAccess, NodePoolSpec, StorageProfileSpec,
    UpgradeSettingsSpec, WorkloadAutoscalerProfileSpec,
};

use lodestone_common::Error;

/// A single validation failure with the offending field path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field (e.g., "defaultNodePool.nodeCount")
    pub field: String,
    /// Description of what's invalid
    pub message: String,
}

/// Outcome of validating a desired-state document
///
/// Collects every violation rather than stopping at the first, so a caller
/// can surface all configuration problems in one pass. Side-effect-free.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// All violations found, in field-declaration order
    pub violations: Vec<Violation>,
}


impl ValidationResult {
    /// True when the document passed every check
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Record a violation for the given field path
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Convert into a `Result`, surfacing the first violation as an
    /// `InvalidConfiguration` error
    pub fn ok(self) -> Result<(), Error> {
        match self.violations.into_iter().next() {
            None => Ok(()),
            Some(v) => Err(Error::invalid_field(v.field, v.message)),
        }
    }
}
