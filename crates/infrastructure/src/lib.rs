//! 存储实现：SQLite 连接管理、迁移以及文档存储

pub mod database;

pub use database::*;
