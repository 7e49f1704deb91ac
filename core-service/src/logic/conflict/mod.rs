//! Conflict Analyzer
//!
//! Shadow / redundancy / contradiction / overlap detection over parsed
//! rulesets, respecting the backend's evaluation order.

pub mod algebra;
pub mod analyzer;

pub use analyzer::{analyze, ConflictFinding, ConflictKind, ConflictReport, ExistingRule};
