//! Process-lifecycle primitives shared by the scheduler and the runners it
//! drives: cooperative shutdown and the per-job pid registry used to route
//! cancellation requests to a running coder CLI subprocess.

pub mod pid_registry;
pub mod shutdown;
