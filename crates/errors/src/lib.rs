use thiserror::Error;

/// 错误分类，调用方按分类分支处理，而不是比较错误实例
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 资源不存在或对当前身份不可见
    NotFound,
    /// 过滤条件、更新字段、状态迁移或流水线校验失败
    BadInput,
    /// 唯一约束冲突
    IdentifierTaken,
    /// 已认证但无权执行
    Unauthorized,
    /// 存储层的瞬时故障
    Storage,
    Serialization,
    Configuration,
    Internal,
}

#[derive(Debug, Error)]
pub enum TrellisError {
    #[error("资源未找到: {0}")]
    NotFound(String),
    #[error("无效输入: {0}")]
    BadInput(String),
    #[error("标识符已被占用: {0}")]
    IdentifierTaken(String),
    #[error("未授权: {0}")]
    Unauthorized(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("存储操作错误: {0}")]
    Storage(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type TrellisResult<T> = Result<T, TrellisError>;

impl TrellisError {
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn bad_input<S: Into<String>>(msg: S) -> Self {
        Self::BadInput(msg.into())
    }
    pub fn identifier_taken<S: Into<String>>(msg: S) -> Self {
        Self::IdentifierTaken(msg.into())
    }
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrellisError::NotFound(_) => ErrorKind::NotFound,
            TrellisError::BadInput(_) => ErrorKind::BadInput,
            TrellisError::IdentifierTaken(_) => ErrorKind::IdentifierTaken,
            TrellisError::Unauthorized(_) => ErrorKind::Unauthorized,
            TrellisError::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            TrellisError::Database(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() =>
            {
                ErrorKind::IdentifierTaken
            }
            TrellisError::Database(_) | TrellisError::Storage(_) => ErrorKind::Storage,
            TrellisError::Serialization(_) => ErrorKind::Serialization,
            TrellisError::Configuration(_) => ErrorKind::Configuration,
            TrellisError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Internal | ErrorKind::Configuration
        )
    }

    /// 只有存储层的瞬时故障值得重试，校验类错误重试也不会成功
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }

    pub fn user_message(&self) -> &str {
        match self.kind() {
            ErrorKind::NotFound => "请求的资源不存在",
            ErrorKind::BadInput => "输入数据验证失败",
            ErrorKind::IdentifierTaken => "该标识符已被使用",
            ErrorKind::Unauthorized => "您没有执行此操作的权限",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(err: serde_json::Error) -> Self {
        TrellisError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TrellisError {
    fn from(err: anyhow::Error) -> Self {
        TrellisError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(TrellisError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(TrellisError::bad_input("x").kind(), ErrorKind::BadInput);
        assert_eq!(
            TrellisError::identifier_taken("x").kind(),
            ErrorKind::IdentifierTaken
        );
        assert_eq!(
            TrellisError::unauthorized("x").kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            TrellisError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            TrellisError::Database(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_retryable_only_for_storage() {
        assert!(TrellisError::storage("连接断开").is_retryable());
        assert!(TrellisError::Database(sqlx::Error::PoolClosed).is_retryable());
        assert!(!TrellisError::not_found("x").is_retryable());
        assert!(!TrellisError::bad_input("x").is_retryable());
        assert!(!TrellisError::internal("x").is_retryable());
    }

    #[test]
    fn test_user_message_hides_details() {
        let err = TrellisError::storage("password=secret");
        assert_eq!(err.user_message(), "系统繁忙，请稍后重试");
        assert!(err.to_string().contains("存储操作错误"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: TrellisError = serde_json::from_str::<u32>("oops").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
