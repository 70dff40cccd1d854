//! Execution layer: communicators, communication scheduling, reductions,
//! and the executable schedule tree.

pub mod comm;
pub mod comm_sched;
pub mod plan;
pub mod reduce;

pub use comm::{Communicator, LocalComm, NoComm, Wait};
pub use comm_sched::{CommInfo, execute_comm, postcomm_plan, precomm_plan};
pub use plan::{ExecNode, test_condition};
pub use reduce::{JoinOp, PodJoin, execute_comm_reduce, group_all_reduce};

#[cfg(feature = "mpi-support")]
pub use comm::{MpiComm, MpiRecv};
