use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_errors::{TrellisError, TrellisResult};

use crate::collection::Collection;
use crate::entities::ROOT_USER;

/// 直接映射到行号列的伪字段
pub const OID_FIELD: &str = "_oid";
/// 直接映射到修订号列的伪字段
pub const REVISION_FIELD: &str = "_revision";

/// 字段在文档中的取值类型，决定排序缺省值与游标编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// 以毫秒整数存储的时间
    Timestamp,
}

impl FieldKind {
    /// 排序时缺失值的替代值，保证缺失值排在最前
    pub fn missing_sort_value(&self) -> Value {
        match self {
            FieldKind::Text => Value::from(""),
            FieldKind::Integer | FieldKind::Timestamp => Value::from(i64::MIN),
            FieldKind::Float => Value::from(f64::MIN),
            FieldKind::Boolean => Value::from(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    /// 数组字段包含某个元素
    Contains(Value),
    IsNull,
    NotNull,
}

/// 作用于文档路径的过滤条件，路径用 `.` 分隔
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Ne(value.into()))
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOp::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOp::NotIn(values.into_iter().map(Into::into).collect()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt(value.into()))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Contains(value.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNull)
    }

    pub fn status<S: ToString>(status: S) -> Self {
        Self::eq("status", status.to_string())
    }

    pub fn status_in<S: ToString>(statuses: &[S]) -> Self {
        Self::is_in("status", statuses.iter().map(|s| s.to_string()))
    }

    pub fn status_not_in<S: ToString>(statuses: &[S]) -> Self {
        Self::not_in("status", statuses.iter().map(|s| s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(TrellisError::bad_input(format!("排序方向无效: {other}"))),
        }
    }
}

/// 排序字段，缺失时按行号排序
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub path: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec {
    pub field: Option<SortField>,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn by(path: impl Into<String>, kind: FieldKind, order: SortOrder) -> Self {
        Self {
            field: Some(SortField {
                path: path.into(),
                kind,
            }),
            order,
        }
    }
}

/// 游标解码后的位置：上一页最后一条记录的排序值与行号
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    pub sort_value: Option<Value>,
    pub oid: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    pub filters: Vec<Filter>,
    pub sort: SortSpec,
    pub after: Option<CursorPosition>,
    pub limit: Option<u64>,
}

/// 调用方传入的列表查询，过滤字段使用对外字段名
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListQuery {
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub limit: u64,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(field.into());
        self.order = order;
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = cursor.into();
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

/// 一页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 游标生效前满足过滤条件的记录总数
    pub total_result_size: u64,
    pub returned_result_size: u64,
    /// 最后一页为空串
    pub next_page_cursor: String,
}

/// 调用者身份，决定可见范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: String,
}

impl Identity {
    pub fn root() -> Self {
        Self::user(ROOT_USER)
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_root(&self) -> bool {
        self.user_id == ROOT_USER
    }

    /// 非 root 身份只能看到自己和 root 拥有的资源；用户只能看到自己；进程只对 root 可见
    pub fn scope_filter(&self, collection: Collection) -> Option<Filter> {
        if self.is_root() {
            return None;
        }
        match collection {
            Collection::Users => Some(Filter::eq("id", self.user_id.as_str())),
            Collection::Processes => Some(Filter::is_in("id", Vec::<Value>::new())),
            Collection::Datasets | Collection::Modules | Collection::Jobs | Collection::Tasks => {
                Some(Filter::is_in(
                    "user",
                    [self.user_id.as_str(), ROOT_USER],
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filter_by_identity() {
        assert!(Identity::root().scope_filter(Collection::Jobs).is_none());

        let alice = Identity::user("alice");
        assert_eq!(
            alice.scope_filter(Collection::Datasets),
            Some(Filter::is_in("user", ["alice", "root"]))
        );
        assert_eq!(
            alice.scope_filter(Collection::Users),
            Some(Filter::eq("id", "alice"))
        );
        assert_eq!(
            alice.scope_filter(Collection::Processes),
            Some(Filter::new("id", FilterOp::In(vec![])))
        );
    }

    #[test]
    fn test_sort_order_parsing() {
        assert_eq!("".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_list_query_deserializes_kebab_case() {
        let query: ListQuery = serde_json::from_value(serde_json::json!({
            "filters": {"status": "running"},
            "sort-by": "creation-time",
            "order": "desc",
            "limit": 20
        }))
        .unwrap();
        assert_eq!(query.sort_by.as_deref(), Some("creation-time"));
        assert_eq!(query.order, SortOrder::Desc);
        assert_eq!(query.limit, 20);
        assert!(query.cursor.is_empty());
    }
}
