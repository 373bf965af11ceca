//! 数据集与模块准备的外部协作者
//!
//! 控制循环只负责认领与状态推进，取数、解包和内容校验交给这里的实现。

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use trellis_domain::{Dataset, DatasetSource, Module, ModuleSource};
use trellis_errors::{TrellisError, TrellisResult};

/// 本地数据集目录中描述 schema 的文件
pub const DATASET_MANIFEST: &str = "schema.json";
/// 本地模块目录中描述 schema 与配置空间的文件
pub const MODULE_MANIFEST: &str = "module.json";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchemaPair {
    pub schema_in: String,
    pub schema_out: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModuleDescription {
    pub schema_in: String,
    pub schema_out: String,
    pub config_space: String,
}

#[async_trait]
pub trait DatasetPreparer: Send + Sync {
    /// 把数据从来源地址取到本地
    async fn transfer(&self, dataset: &Dataset) -> TrellisResult<()>;

    async fn unpack(&self, dataset: &Dataset) -> TrellisResult<()>;

    /// 校验数据内容，返回数据集的输入输出 schema
    async fn validate(&self, dataset: &Dataset) -> TrellisResult<SchemaPair>;
}

#[async_trait]
pub trait ModulePreparer: Send + Sync {
    async fn transfer(&self, module: &Module) -> TrellisResult<()>;

    /// 校验模块，返回它的 schema 与配置空间
    async fn validate(&self, module: &Module) -> TrellisResult<ModuleDescription>;
}

/// 只支持本地目录与已上传来源的准备器
///
/// 本地来源的地址必须是一个目录；资源本身没有声明 schema 时从目录中的描述文件读取。
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSourcePreparer;

impl LocalSourcePreparer {
    pub fn new() -> Self {
        Self
    }
}

async fn require_directory(address: &str) -> TrellisResult<PathBuf> {
    let path = PathBuf::from(address);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => Ok(path),
        Ok(_) => Err(TrellisError::bad_input(format!("{address} 不是目录"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(TrellisError::bad_input(format!("来源路径 {address} 不存在")))
        }
        Err(e) => Err(TrellisError::internal(format!("读取 {address} 失败: {e}"))),
    }
}

async fn read_manifest<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> TrellisResult<T> {
    let path = dir.join(name);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TrellisError::bad_input(format!(
                "{} 中缺少 {name}",
                dir.display()
            )))
        }
        Err(e) => {
            return Err(TrellisError::internal(format!(
                "读取 {} 失败: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_str(&text)
        .map_err(|e| TrellisError::bad_input(format!("{} 格式错误: {e}", path.display())))
}

#[async_trait]
impl DatasetPreparer for LocalSourcePreparer {
    async fn transfer(&self, dataset: &Dataset) -> TrellisResult<()> {
        match dataset.source {
            DatasetSource::Upload => Ok(()),
            DatasetSource::Local => require_directory(&dataset.source_address).await.map(|_| ()),
            other => Err(TrellisError::bad_input(format!("不支持的数据集来源 {other}"))),
        }
    }

    async fn unpack(&self, dataset: &Dataset) -> TrellisResult<()> {
        if dataset.source == DatasetSource::Local {
            require_directory(&dataset.source_address).await?;
        }
        debug!(dataset_id = %dataset.id, "数据集无需解包");
        Ok(())
    }

    async fn validate(&self, dataset: &Dataset) -> TrellisResult<SchemaPair> {
        if !dataset.schema_in.is_empty() && !dataset.schema_out.is_empty() {
            return Ok(SchemaPair {
                schema_in: dataset.schema_in.clone(),
                schema_out: dataset.schema_out.clone(),
            });
        }
        if dataset.source != DatasetSource::Local {
            return Err(TrellisError::bad_input(format!(
                "数据集 {} 没有声明 schema",
                dataset.id
            )));
        }

        let dir = require_directory(&dataset.source_address).await?;
        let schemas: SchemaPair = read_manifest(&dir, DATASET_MANIFEST).await?;
        if schemas.schema_in.is_empty() || schemas.schema_out.is_empty() {
            return Err(TrellisError::bad_input(format!(
                "{DATASET_MANIFEST} 必须同时给出 schema-in 与 schema-out"
            )));
        }
        Ok(schemas)
    }
}

#[async_trait]
impl ModulePreparer for LocalSourcePreparer {
    async fn transfer(&self, module: &Module) -> TrellisResult<()> {
        match module.source {
            ModuleSource::Upload => Ok(()),
            ModuleSource::Local => require_directory(&module.source_address).await.map(|_| ()),
            other => Err(TrellisError::bad_input(format!("不支持的模块来源 {other}"))),
        }
    }

    async fn validate(&self, module: &Module) -> TrellisResult<ModuleDescription> {
        let declared = ModuleDescription {
            schema_in: module.schema_in.clone(),
            schema_out: module.schema_out.clone(),
            config_space: module.config_space.clone(),
        };
        if module.source != ModuleSource::Local
            || (!declared.schema_in.is_empty() && !declared.schema_out.is_empty())
        {
            return Ok(declared);
        }

        let dir = require_directory(&module.source_address).await?;
        let manifest: ModuleDescription = read_manifest(&dir, MODULE_MANIFEST).await?;
        Ok(ModuleDescription {
            config_space: if declared.config_space.is_empty() {
                manifest.config_space
            } else {
                declared.config_space
            },
            ..manifest
        })
    }
}
