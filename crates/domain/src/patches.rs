//! 各资源允许调用方修改的字段
//!
//! 字段映射先反序列化为类型化补丁，未知字段与非法取值在写入前以 `BadInput` 拒绝。

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use trellis_errors::{TrellisError, TrellisResult};

use crate::entities::{DatasetStatus, JobStatus, ModuleStatus, TaskStatus, UserStatus};
use crate::pipeline::Stage;

pub fn parse_patch<P: DeserializeOwned>(fields: Map<String, Value>) -> TrellisResult<P> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| TrellisError::bad_input(format!("更新字段无效: {e}")))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DatasetPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schema_in: Option<String>,
    pub schema_out: Option<String>,
    pub status: Option<DatasetStatus>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ModulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schema_in: Option<String>,
    pub schema_out: Option<String>,
    pub config_space: Option<String>,
    pub status: Option<ModuleStatus>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobPatch {
    pub models: Option<Vec<String>>,
    pub accept_new_models: Option<bool>,
    pub max_tasks: Option<u64>,
    pub status: Option<JobStatus>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TaskPatch {
    pub quality: Option<f64>,
    pub quality_train: Option<f64>,
    pub quality_expected: Option<f64>,
    pub alt_qualities: Option<Vec<f64>>,
    pub stage: Option<Stage>,
    pub status: Option<TaskStatus>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UserPatch {
    pub name: Option<String>,
    pub status: Option<UserStatus>,
    /// 已哈希的口令
    pub password: Option<String>,
}

impl DatasetPatch {
    pub fn status(status: DatasetStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }
}

impl ModulePatch {
    pub fn status(status: ModuleStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }
}

impl JobPatch {
    pub fn status(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }
}

impl TaskPatch {
    pub fn status(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_errors::ErrorKind;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_known_fields() {
        let patch: TaskPatch = parse_patch(fields(json!({
            "quality": 0.91,
            "alt-qualities": [0.5, 0.25],
            "stage": "predict",
            "status": "running"
        })))
        .unwrap();
        assert_eq!(patch.quality, Some(0.91));
        assert_eq!(patch.alt_qualities, Some(vec![0.5, 0.25]));
        assert_eq!(patch.stage, Some(Stage::Predict));
        assert_eq!(patch.status, Some(TaskStatus::Running));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_patch::<JobPatch>(fields(json!({"dataset": "other"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = parse_patch::<DatasetPatch>(fields(json!({"status": "deleted"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_process_field_not_patchable() {
        assert!(parse_patch::<ModulePatch>(fields(json!({"process": "p1"}))).is_err());
        assert!(parse_patch::<UserPatch>(fields(json!({"api-key": "k"}))).is_err());
    }
}
