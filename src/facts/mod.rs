//! Fact and rule databases: containers, stores, rule descriptors, and the
//! scheduling-metadata store.

pub mod container;
pub mod rule;
pub mod sched_db;
pub mod store;

pub use container::{Container, MapContainer, SliceContainer};
pub use rule::{
    Clause, FnRule, Qualifier, RuleClass, RuleDatabase, RuleDescriptor, RuleId, RuleImpl,
};
pub use sched_db::{DupPolicy, SchedDb, VarSched};
pub use store::{DistributeInfo, FactStore, InMemoryFacts, Preimage};
