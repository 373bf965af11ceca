//! Trellis 领域层
//!
//! 资源实体、状态机、查询模型以及围绕它们的领域服务。存储通过 [`ResourceStore`] 抽象，
//! 具体实现在基础设施层。

pub mod collection;
pub mod cursor;
pub mod entities;
pub mod patches;
pub mod pipeline;
pub mod query;
pub mod repositories;
pub mod schema;
pub mod services;
pub mod state_machine;

pub use collection::Collection;
pub use entities::*;
pub use patches::{DatasetPatch, JobPatch, ModulePatch, TaskPatch, UserPatch};
pub use pipeline::{Stage, StageGraph};
pub use query::{
    FieldKind, Filter, FilterOp, FindSpec, Identity, ListQuery, Page, SortOrder, SortSpec,
};
pub use repositories::{DocumentUpdate, Resource, ResourceStore, StoredDocument};
pub use schema::{ExactSchemaOracle, SchemaOracle};
pub use services::*;
pub use state_machine::{StateMachine, Transition};
pub use trellis_errors::{ErrorKind, TrellisError, TrellisResult};
