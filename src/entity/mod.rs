//! Entity-set algebra and symbolic variable identities.

pub mod entity_set;
pub mod variable;

pub use entity_set::{Entity, EntitySet, Interval, UNIVERSE_MAX, UNIVERSE_MIN};
pub use variable::{TimeRef, VarId, Variable, VariableRegistry};
