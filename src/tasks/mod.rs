//! Background tasks.
//!
//! - [`review_worker`]: the per-partition consumer state machine.
//! - [`worker_manager`]: starts, reloads and stops workers as rules change.
//! - [`lifecycle`]: spawning helpers shared by the binary.

pub mod lifecycle;
pub mod review_worker;
pub mod worker_manager;

pub use lifecycle::{spawn_cancellable_task, spawn_managed_task};
pub use review_worker::{IdleRecovery, ReviewWorker, ReviewWorkerConfig, WorkerDeps, WorkerState};
pub use worker_manager::{WorkerManager, WorkerManagerConfig};
