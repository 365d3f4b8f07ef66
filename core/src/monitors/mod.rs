//! Log source monitors: turn watched files and
//! container log streams into entries submitted to the [`crate::dispatcher::Dispatcher`].

pub mod container_monitor;
pub mod file_monitor;
pub mod fs;

pub use container_monitor::ContainerMonitor;
pub use file_monitor::FileMonitor;
