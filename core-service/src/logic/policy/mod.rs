//! Policy Model
//!
//! Construction, validation and canonicalization of backend-neutral rules.

pub mod canonical;
pub mod types;
pub mod validate;

pub use canonical::{canonicalize, matches_equivalent, rules_equivalent};
pub use types::{
    Action, AddrSpec, Direction, Family, Origin, PolicyRule, PortSpec, Protocol, RateLimit,
    RenderedRule, RulesetImage,
};
pub use validate::{validate_comment, validate_rule};
