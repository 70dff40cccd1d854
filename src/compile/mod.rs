//! Schedule compilation: existence/request analysis, lifetime placement,
//! and plan emission over the supernode hierarchy.

pub mod alloc;
pub mod compilers;
pub mod context;
pub mod delete;
pub mod existential;
pub mod recurrence;
pub mod requests;
pub mod rotate;

pub use compilers::{generate_schedule, rule_order};
pub use context::{CompileOptions, CompilerContext, PlanOrdering};
pub use recurrence::RecurrenceChains;
