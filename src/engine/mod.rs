//! UCI engine process management and the worker pool built on top of it.

pub mod pool;
pub mod process;
pub mod uci;

pub use pool::{engine_task, EnginePool, TaskHandle, WorkCoordinator};
pub use process::{EngineProcess, PositionEval};
pub use uci::UciCommunicator;
