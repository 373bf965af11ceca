//! 工作进程上的轮询循环
//!
//! 保活、任务状态维护与任务执行。任务执行在阶段之间重新读取状态，
//! 观察到暂停中或终止中时在当前阶段结束后停下。

pub mod context;
pub mod executors;
pub mod keepalive;
pub mod task_maintainer;
pub mod task_runner;

pub use context::WorkerContext;
pub use executors::{CommandStageExecutor, StageExecutor};
pub use keepalive::KeepaliveManager;
pub use task_maintainer::TaskStatusMaintainer;
pub use task_runner::TaskRunner;
