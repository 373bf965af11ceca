use serde_json::Value;
use trellis_errors::{TrellisError, TrellisResult};

/// 数据集与模块的输入输出 schema 判定
///
/// schema 以紧凑 JSON 文本存储。存储层无法理解 schema 语义，
/// 按 schema 过滤时由调用方在取回结果后用它做二次筛选。
pub trait SchemaOracle: Send + Sync {
    fn is_valid(&self, schema: &str) -> bool;

    /// `candidate` 是否满足 `reference` 描述的约束
    fn matches(&self, candidate: &str, reference: &str) -> bool;

    /// 校验并规范化 schema 文本，空串保持为空
    fn normalize(&self, schema: &str) -> TrellisResult<String> {
        if schema.is_empty() {
            return Ok(String::new());
        }
        if !self.is_valid(schema) {
            return Err(TrellisError::bad_input(format!("schema 无效: {schema}")));
        }
        compact_json(schema)
    }
}

/// 结构相等判定：两边解析为 JSON 后完全一致才算匹配，空 schema 不匹配任何东西
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSchemaOracle;

impl SchemaOracle for ExactSchemaOracle {
    fn is_valid(&self, schema: &str) -> bool {
        matches!(
            serde_json::from_str::<Value>(schema),
            Ok(Value::Object(_)) | Ok(Value::Array(_))
        )
    }

    fn matches(&self, candidate: &str, reference: &str) -> bool {
        if candidate.is_empty() || reference.is_empty() {
            return false;
        }
        match (
            serde_json::from_str::<Value>(candidate),
            serde_json::from_str::<Value>(reference),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

pub fn compact_json(text: &str) -> TrellisResult<String> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TrellisError::bad_input(format!("JSON 解析失败: {e}")))?;
    Ok(serde_json::to_string(&value)?)
}
