use trellis_errors::{TrellisError, TrellisResult};

/// 配置校验接口
pub trait ConfigValidator {
    fn validate(&self) -> TrellisResult<()>;
}

/// 通用校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> TrellisResult<()> {
        if value.trim().is_empty() {
            return Err(TrellisError::config_error(format!(
                "{field_name} 不能为空"
            )));
        }
        Ok(())
    }

    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> TrellisResult<()> {
        if timeout_seconds == 0 {
            return Err(TrellisError::config_error(format!(
                "{field_name} 必须大于0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(TrellisError::config_error(format!(
                "{field_name} 不能超过3600秒"
            )));
        }
        Ok(())
    }

    pub fn validate_count(count: u64, field_name: &str) -> TrellisResult<()> {
        if count == 0 {
            return Err(TrellisError::config_error(format!(
                "{field_name} 必须大于0"
            )));
        }
        if count > 10000 {
            return Err(TrellisError::config_error(format!(
                "{field_name} 不能超过10000"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, allowed: &[&str], field_name: &str) -> TrellisResult<()> {
        if !allowed.contains(&value) {
            return Err(TrellisError::config_error(format!(
                "{field_name} 的取值必须是 {allowed:?} 之一，实际为 {value}"
            )));
        }
        Ok(())
    }
}
