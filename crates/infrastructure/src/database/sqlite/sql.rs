//! 过滤条件、排序与更新到 SQLite 语句片段的翻译
//!
//! 文档字段通过 `json_extract(doc, '$."a"."b"')` 读取；路径段只允许小写字母、数字、
//! 下划线和连字符，直接拼进语句，取值一律走绑定参数。

use serde_json::Value;
use trellis_domain::query::{
    CursorPosition, Filter, FilterOp, SortOrder, SortSpec, OID_FIELD, REVISION_FIELD,
};
use trellis_domain::repositories::DocumentUpdate;
use trellis_errors::{TrellisError, TrellisResult};

/// 绑定参数
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlArg {
    /// 把 JSON 标量转换为 SQLite 取值，布尔值按 0/1 处理，与 `json_extract` 的结果一致
    pub fn from_json(value: &Value) -> TrellisResult<Self> {
        Ok(match value {
            Value::Null => SqlArg::Null,
            Value::Bool(b) => SqlArg::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlArg::Integer(i),
                None => SqlArg::Real(n.as_f64().ok_or_else(|| {
                    TrellisError::bad_input(format!("数值 {n} 超出范围"))
                })?),
            },
            Value::String(s) => SqlArg::Text(s.clone()),
            other => {
                return Err(TrellisError::bad_input(format!(
                    "过滤值必须是标量: {other}"
                )))
            }
        })
    }
}

/// 带绑定参数的语句片段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_arg(&mut self, arg: SqlArg) -> &mut Self {
        self.sql.push('?');
        self.args.push(arg);
        self
    }

    pub fn append(&mut self, other: &Fragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args.iter().cloned());
        self
    }
}

/// 把 `a.b` 形式的路径转换为 JSON 路径 `$."a"."b"`
pub fn json_path(path: &str) -> TrellisResult<String> {
    let mut out = String::from("$");
    for segment in path.split('.') {
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(TrellisError::bad_input(format!("字段路径无效: {path}")));
        }
        out.push_str(&format!(".\"{segment}\""));
    }
    Ok(out)
}

/// 字段取值表达式
pub fn field_expr(path: &str) -> TrellisResult<String> {
    match path {
        OID_FIELD => Ok("oid".to_string()),
        REVISION_FIELD => Ok("revision".to_string()),
        _ => Ok(format!("json_extract(doc, '{}')", json_path(path)?)),
    }
}

fn filter_fragment(filter: &Filter) -> TrellisResult<Fragment> {
    let expr = field_expr(&filter.field)?;
    let mut frag = Fragment::default();

    let compare = |frag: &mut Fragment, op: &str, value: &Value| -> TrellisResult<()> {
        frag.push(&format!("{expr} {op} "))
            .push_arg(SqlArg::from_json(value)?);
        Ok(())
    };

    match &filter.op {
        FilterOp::Eq(Value::Null) | FilterOp::IsNull => {
            frag.push(&format!("{expr} IS NULL"));
        }
        FilterOp::Ne(Value::Null) | FilterOp::NotNull => {
            frag.push(&format!("{expr} IS NOT NULL"));
        }
        FilterOp::Eq(value) => compare(&mut frag, "=", value)?,
        // 缺失字段视为不等于任何值
        FilterOp::Ne(value) => {
            frag.push(&format!("({expr} IS NULL OR {expr} <> "))
                .push_arg(SqlArg::from_json(value)?)
                .push(")");
        }
        FilterOp::Lt(value) => compare(&mut frag, "<", value)?,
        FilterOp::Lte(value) => compare(&mut frag, "<=", value)?,
        FilterOp::Gt(value) => compare(&mut frag, ">", value)?,
        FilterOp::Gte(value) => compare(&mut frag, ">=", value)?,
        FilterOp::In(values) if values.is_empty() => {
            frag.push("0");
        }
        FilterOp::NotIn(values) if values.is_empty() => {
            frag.push("1");
        }
        FilterOp::In(values) => {
            frag.push(&format!("{expr} IN ("));
            push_list(&mut frag, values)?;
            frag.push(")");
        }
        FilterOp::NotIn(values) => {
            frag.push(&format!("({expr} IS NULL OR {expr} NOT IN ("));
            push_list(&mut frag, values)?;
            frag.push("))");
        }
        FilterOp::Contains(value) => {
            frag.push(&format!(
                "EXISTS(SELECT 1 FROM json_each(doc, '{}') WHERE value = ",
                json_path(&filter.field)?
            ))
            .push_arg(SqlArg::from_json(value)?)
            .push(")");
        }
    }
    Ok(frag)
}

fn push_list(frag: &mut Fragment, values: &[Value]) -> TrellisResult<()> {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            frag.push(", ");
        }
        frag.push_arg(SqlArg::from_json(value)?);
    }
    Ok(())
}

/// 过滤条件按 AND 连接，没有条件时为恒真
pub fn where_clause(filters: &[Filter]) -> TrellisResult<Fragment> {
    if filters.is_empty() {
        return Ok(Fragment::new("1"));
    }
    let mut frag = Fragment::default();
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            frag.push(" AND ");
        }
        frag.push("(").append(&filter_fragment(filter)?).push(")");
    }
    Ok(frag)
}

/// 排序表达式，缺失值用字段类型的缺省值代替
fn sort_expr(sort: &SortSpec) -> TrellisResult<Option<Fragment>> {
    let Some(field) = &sort.field else {
        return Ok(None);
    };
    let mut frag = Fragment::new(format!("COALESCE({}, ", field_expr(&field.path)?));
    frag.push_arg(SqlArg::from_json(&field.kind.missing_sort_value())?)
        .push(")");
    Ok(Some(frag))
}

fn direction(order: SortOrder) -> (&'static str, &'static str) {
    match order {
        SortOrder::Asc => ("ASC", ">"),
        SortOrder::Desc => ("DESC", "<"),
    }
}

/// ORDER BY 子句，行号作为第二排序键保证顺序稳定
pub fn order_clause(sort: &SortSpec) -> TrellisResult<Fragment> {
    let (dir, _) = direction(sort.order);
    let mut frag = Fragment::new(" ORDER BY ");
    if let Some(expr) = sort_expr(sort)? {
        frag.append(&expr).push(&format!(" {dir}, "));
    }
    frag.push(&format!("oid {dir}"));
    Ok(frag)
}

/// 游标之后的记录
pub fn cursor_clause(sort: &SortSpec, after: &CursorPosition) -> TrellisResult<Fragment> {
    let (_, cmp) = direction(sort.order);
    let mut frag = Fragment::default();
    match (sort_expr(sort)?, &after.sort_value) {
        (Some(expr), Some(value)) => {
            let value = SqlArg::from_json(value)?;
            frag.push("(")
                .append(&expr)
                .push(&format!(" {cmp} "))
                .push_arg(value.clone())
                .push(" OR (")
                .append(&expr)
                .push(" = ")
                .push_arg(value)
                .push(&format!(" AND oid {cmp} "))
                .push_arg(SqlArg::Integer(after.oid))
                .push("))");
        }
        (None, None) => {
            frag.push(&format!("oid {cmp} ")).push_arg(SqlArg::Integer(after.oid));
        }
        _ => return Err(TrellisError::bad_input("游标与排序字段不匹配")),
    }
    Ok(frag)
}

fn json_arg(value: &Value) -> TrellisResult<SqlArg> {
    Ok(SqlArg::Text(serde_json::to_string(value)?))
}

/// 更新后的文档表达式
///
/// 先做去重追加再覆盖字段；同一路径不会同时出现在两类操作中。
pub fn update_expr(update: &DocumentUpdate) -> TrellisResult<Fragment> {
    let mut expr = Fragment::new("doc");

    for (path, value) in &update.append_unique {
        let json_path = json_path(path)?;
        let mut next = Fragment::new(format!(
            "CASE WHEN EXISTS(SELECT 1 FROM json_each(doc, '{json_path}') WHERE value = "
        ));
        next.push_arg(SqlArg::from_json(value)?)
            .push(") THEN ")
            .append(&expr)
            .push(" ELSE json_insert(")
            .append(&expr)
            .push(&format!(", '{json_path}[#]', json("))
            .push_arg(json_arg(value)?)
            .push(")) END");
        expr = next;
    }

    if !update.set.is_empty() {
        let mut next = Fragment::new("json_set(");
        next.append(&expr);
        for (path, value) in &update.set {
            next.push(&format!(", '{}', json(", json_path(path)?))
                .push_arg(json_arg(value)?)
                .push(")");
        }
        next.push(")");
        expr = next;
    }

    Ok(expr)
}
