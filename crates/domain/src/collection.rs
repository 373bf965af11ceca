use std::fmt;

use serde_json::Value;
use trellis_errors::{TrellisError, TrellisResult};

use crate::query::{FieldKind, Filter, FilterOp, SortField, SortOrder, SortSpec};

/// 存储中的资源集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Datasets,
    Modules,
    Jobs,
    Tasks,
    Processes,
}

/// 对外开放过滤与排序的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// 对外字段名
    pub name: &'static str,
    /// 文档内路径
    pub path: &'static str,
    pub kind: FieldKind,
    pub sortable: bool,
    /// 数组字段，等值过滤按包含处理
    pub array: bool,
}

const fn field(name: &'static str, path: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        path,
        kind,
        sortable: false,
        array: false,
    }
}

const fn sortable(name: &'static str, path: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        path,
        kind,
        sortable: true,
        array: false,
    }
}

const fn array(name: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        path,
        kind: FieldKind::Text,
        sortable: false,
        array: true,
    }
}

use FieldKind::{Boolean, Float, Integer, Text, Timestamp};

const USER_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    sortable("name", "name", Text),
    field("status", "status", Text),
];

const DATASET_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    sortable("user", "user", Text),
    sortable("name", "name", Text),
    field("status", "status", Text),
    field("source", "source", Text),
    field("source-address", "source-address", Text),
    field("process", "process", Text),
    sortable("creation-time", "creation-time", Timestamp),
];

const MODULE_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    sortable("user", "user", Text),
    sortable("name", "name", Text),
    field("type", "type", Text),
    field("label", "label", Text),
    field("status", "status", Text),
    field("source", "source", Text),
    field("source-address", "source-address", Text),
    field("process", "process", Text),
    sortable("creation-time", "creation-time", Timestamp),
];

const JOB_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    sortable("user", "user", Text),
    field("dataset", "dataset", Text),
    field("objective", "objective", Text),
    field("status", "status", Text),
    field("accept-new-models", "accept-new-models", Boolean),
    array("model", "models"),
    array("alt-objective", "alt-objectives"),
    field("process", "process", Text),
    sortable("max-tasks", "max-tasks", Integer),
    sortable("creation-time", "creation-time", Timestamp),
    sortable("running-time-start", "running-time.start", Timestamp),
    sortable("running-time-end", "running-time.end", Timestamp),
];

const TASK_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    sortable("user", "user", Text),
    field("job", "job", Text),
    field("dataset", "dataset", Text),
    field("model", "model", Text),
    field("objective", "objective", Text),
    array("alt-objective", "alt-objectives"),
    field("status", "status", Text),
    field("stage", "stage", Text),
    field("process", "process", Text),
    sortable("quality", "quality", Float),
    sortable("quality-train", "quality-train", Float),
    sortable("quality-expected", "quality-expected", Float),
    sortable("creation-time", "creation-time", Timestamp),
];

const PROCESS_FIELDS: &[FieldSpec] = &[
    sortable("id", "id", Text),
    field("process-id", "process-id", Integer),
    field("host-id", "host-id", Text),
    field("host-address", "host-address", Text),
    field("type", "type", Text),
    field("resource", "resource", Text),
    field("status", "status", Text),
    sortable("running-ordinal", "running-ordinal", Integer),
    sortable("start-time", "start-time", Timestamp),
    sortable("last-keepalive", "last-keepalive", Timestamp),
];

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Users,
        Collection::Datasets,
        Collection::Modules,
        Collection::Jobs,
        Collection::Tasks,
        Collection::Processes,
    ];

    /// 带 `process` 锁字段的集合
    pub const LOCKABLE: [Collection; 4] = [
        Collection::Datasets,
        Collection::Modules,
        Collection::Jobs,
        Collection::Tasks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Datasets => "datasets",
            Collection::Modules => "modules",
            Collection::Jobs => "jobs",
            Collection::Tasks => "tasks",
            Collection::Processes => "processes",
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            Collection::Users => USER_FIELDS,
            Collection::Datasets => DATASET_FIELDS,
            Collection::Modules => MODULE_FIELDS,
            Collection::Jobs => JOB_FIELDS,
            Collection::Tasks => TASK_FIELDS,
            Collection::Processes => PROCESS_FIELDS,
        }
    }

    pub fn field(&self, name: &str) -> TrellisResult<&'static FieldSpec> {
        self.fields()
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                TrellisError::bad_input(format!("{} 不支持按字段 {name} 查询", self.name()))
            })
    }

    /// 把对外字段名的等值过滤翻译成文档路径上的过滤条件
    pub fn translate_filter(&self, name: &str, value: &Value) -> TrellisResult<Filter> {
        let spec = self.field(name)?;
        let value = coerce(spec, value)?;
        let op = if spec.array {
            FilterOp::Contains(value)
        } else {
            FilterOp::Eq(value)
        };
        Ok(Filter::new(spec.path, op))
    }

    pub fn translate_sort(&self, name: Option<&str>, order: SortOrder) -> TrellisResult<SortSpec> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(SortSpec { field: None, order });
        };
        let spec = self.field(name)?;
        if !spec.sortable {
            return Err(TrellisError::bad_input(format!(
                "{} 不支持按字段 {name} 排序",
                self.name()
            )));
        }
        Ok(SortSpec {
            field: Some(SortField {
                path: spec.path.to_string(),
                kind: spec.kind,
            }),
            order,
        })
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// 查询参数常以字符串传入，按字段类型转换
fn coerce(spec: &FieldSpec, value: &Value) -> TrellisResult<Value> {
    let invalid = || {
        TrellisError::bad_input(format!("字段 {} 的过滤值无效: {value}", spec.name))
    };
    match (spec.kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (Text, Value::String(_)) => Ok(value.clone()),
        (Integer | Timestamp, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
        (Integer | Timestamp, Value::String(s)) => {
            s.parse::<i64>().map(Value::from).map_err(|_| invalid())
        }
        (Float, Value::Number(_)) => Ok(value.clone()),
        (Float, Value::String(s)) => s.parse::<f64>().map(Value::from).map_err(|_| invalid()),
        (Boolean, Value::Bool(_)) => Ok(value.clone()),
        (Boolean, Value::String(s)) => s.parse::<bool>().map(Value::from).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}
