//! Dependency-graph construction, topological scheduling, and recursive
//! decomposition into supernodes.

pub mod builder;
pub mod decompose;
pub mod digraph;
pub mod schedule_dag;

pub use builder::{build_dependency_graph, covers_targets};
pub use decompose::{
    CondInfo, LoopInfo, MultiLevelGraph, NodeId, Supernode, SupernodeKind, decompose,
    marker_target,
};
pub use digraph::{Digraph, Vertex, VertexSet, as_rule, as_var, rule_vertex, var_vertex};
pub use schedule_dag::schedule_dag;
