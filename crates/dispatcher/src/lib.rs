//! 控制进程上的轮询循环
//!
//! 死亡进程回收、作业状态维护，以及数据集与模块的准备流程。
//! 所有循环都通过存储上的原子认领协调，彼此之间不共享进程内状态。

pub mod context;
pub mod dataset_processor;
pub mod dead_process_reaper;
pub mod job_maintainer;
pub mod module_processor;
pub mod preparers;

pub use context::ControllerContext;
pub use dataset_processor::{DatasetProcessor, DatasetStep};
pub use dead_process_reaper::{DeadProcessReaper, DeadProcessReaperConfig};
pub use job_maintainer::JobStatusMaintainer;
pub use module_processor::{ModuleProcessor, ModuleStep};
pub use preparers::{
    DatasetPreparer, LocalSourcePreparer, ModuleDescription, ModulePreparer, SchemaPair,
};
