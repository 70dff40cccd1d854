//! # rule-mesh
//!
//! A declarative, rule-based parallel execution engine for partitioned
//! entity data. A host program describes its computation as a database of
//! rules over named variables (pure bodies with set-relational source,
//! target, and constraint clauses); `rule-mesh` builds the dependency graph,
//! decomposes it into a hierarchy of dag / loop / conditional supernodes,
//! analyzes existence, requests, and storage lifetimes, and emits an
//! executable schedule whose every rule invocation, message exchange,
//! allocation, and deallocation is an explicit plan node.
//!
//! Schedules are deterministic: every rank of a distributed run derives the
//! identical plan from the same rule database and partition table, so
//! communication needs no runtime negotiation.
//!
//! ## Quick tour
//!
//! - [`entity`]: interval-set algebra over opaque entities; interned
//!   symbolic variables (`x{n+1}`, `wall::flux`).
//! - [`facts`]: value containers, the fact store, rule descriptors.
//! - [`graph`]: dependency-graph construction, topological scheduling,
//!   supernode decomposition.
//! - [`compile`]: existence/request analysis, lifetime placement, and the
//!   compilers; entry point [`compile::generate_schedule`].
//! - [`exec`]: communicators, communication scheduling, reductions, and the
//!   [`exec::ExecNode`] plan tree.
//!
//! `Ok(None)` from [`compile::generate_schedule`] means no rule path
//! connects the given facts to the requested targets — a valid answer, not
//! an error. Everything that does go wrong surfaces as a
//! [`RuleMeshError`](rule_error::RuleMeshError).

pub mod compile;
pub mod entity;
pub mod exec;
pub mod facts;
pub mod graph;
pub mod rule_error;

/// Convenience re-exports for host programs.
pub mod prelude {
    pub use crate::compile::{CompileOptions, PlanOrdering, generate_schedule};
    pub use crate::entity::{Entity, EntitySet, VarId, Variable, VariableRegistry};
    pub use crate::exec::{Communicator, ExecNode, JoinOp, LocalComm, NoComm, PodJoin};
    pub use crate::facts::{
        Clause, Container, DistributeInfo, FactStore, FnRule, InMemoryFacts, MapContainer,
        Qualifier, RuleClass, RuleDatabase, RuleDescriptor, RuleId, RuleImpl, SliceContainer,
    };
    pub use crate::rule_error::RuleMeshError;
}
