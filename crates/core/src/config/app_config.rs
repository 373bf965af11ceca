use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use trellis_errors::{TrellisError, TrellisResult};

use super::validation::{ConfigValidator, ValidationUtils};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub process: ProcessConfig,
    pub polling: PollingConfig,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// SQLite写锁等待时间（毫秒）
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://trellis.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            busy_timeout_ms: 5000,
        }
    }
}

/// 进程注册与存活检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// 心跳间隔（秒）
    pub keepalive_interval_seconds: u64,
    /// 超过多少个心跳周期未更新即判定进程死亡
    pub dead_process_multiplier: u32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_seconds: 5, // 5秒一次心跳
            dead_process_multiplier: 5,    // 25秒无心跳视为死亡
        }
    }
}

impl ProcessConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }

    pub fn dead_process_cutoff(&self) -> Duration {
        self.keepalive_interval() * self.dead_process_multiplier
    }
}

/// 轮询循环与簿记重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// 没有可认领工作时的休眠时间（毫秒）
    pub listener_period_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            listener_period_ms: 1000,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            retry_backoff_multiplier: 2.0,
        }
    }
}

impl PollingConfig {
    pub fn listener_period(&self) -> Duration {
        Duration::from_millis(self.listener_period_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            default_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }
}

/// 控制进程上运行的循环开关
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub reaper_enabled: bool,
    pub job_maintenance_enabled: bool,
    pub dataset_processing_enabled: bool,
    pub module_processing_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reaper_enabled: true,
            job_maintenance_enabled: true,
            dataset_processing_enabled: true,
            module_processing_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub task_maintenance_enabled: bool,
    /// 执行任务阶段的外部命令，首项为程序，其余为参数；为空时任务执行循环不启动
    pub stage_command: Vec<String>,
    /// 单个阶段的最长执行时间，0 表示不限
    pub stage_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            task_maintenance_enabled: true,
            stage_command: Vec::new(),
            stage_timeout_seconds: 0,
        }
    }
}

impl WorkerConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_seconds > 0).then(|| Duration::from_secs(self.stage_timeout_seconds))
    }
}

/// 已认证用户的进程内缓存
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub user_ttl_seconds: u64,
    pub user_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            user_ttl_seconds: 300,
            user_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/trellis.toml",
                "trellis.toml",
                "/etc/trellis/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TRELLIS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> TrellisResult<()> {
        self.database.validate()?;
        self.process.validate()?;
        self.polling.validate()?;
        self.worker.validate()?;
        self.cache.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> TrellisResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(TrellisError::config_error(
                "database.url 必须以 sqlite: 开头",
            ));
        }
        ValidationUtils::validate_count(self.max_connections.into(), "database.max_connections")?;
        if self.min_connections > self.max_connections {
            return Err(TrellisError::config_error(
                "database.min_connections 不能大于 max_connections",
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.connection_timeout_seconds,
            "database.connection_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.idle_timeout_seconds,
            "database.idle_timeout_seconds",
        )?;
        Ok(())
    }
}

impl ConfigValidator for ProcessConfig {
    fn validate(&self) -> TrellisResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.keepalive_interval_seconds,
            "process.keepalive_interval_seconds",
        )?;
        // 截止时间必须是心跳周期的数倍，否则调度抖动会误杀存活进程
        if self.dead_process_multiplier < 2 {
            return Err(TrellisError::config_error(
                "process.dead_process_multiplier 至少为2",
            ));
        }
        Ok(())
    }
}

impl ConfigValidator for PollingConfig {
    fn validate(&self) -> TrellisResult<()> {
        ValidationUtils::validate_count(self.listener_period_ms, "polling.listener_period_ms")?;
        if self.retry_initial_delay_ms == 0 || self.retry_max_delay_ms < self.retry_initial_delay_ms
        {
            return Err(TrellisError::config_error(
                "polling.retry_max_delay_ms 必须不小于 retry_initial_delay_ms 且二者大于0",
            ));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(TrellisError::config_error(
                "polling.retry_backoff_multiplier 不能小于1.0",
            ));
        }
        Ok(())
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> TrellisResult<()> {
        if let Some(program) = self.stage_command.first() {
            ValidationUtils::validate_not_empty(program, "worker.stage_command[0]")?;
        }
        Ok(())
    }
}

impl ConfigValidator for CacheConfig {
    fn validate(&self) -> TrellisResult<()> {
        ValidationUtils::validate_timeout_seconds(self.user_ttl_seconds, "cache.user_ttl_seconds")?;
        ValidationUtils::validate_count(self.user_capacity, "cache.user_capacity")?;
        Ok(())
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> TrellisResult<()> {
        ValidationUtils::validate_one_of(
            &self.log_level,
            &["trace", "debug", "info", "warn", "error"],
            "observability.log_level",
        )?;
        ValidationUtils::validate_one_of(
            &self.log_format,
            &["json", "pretty", "compact"],
            "observability.log_format",
        )?;
        if self.metrics_enabled {
            ValidationUtils::validate_not_empty(
                &self.metrics_bind_address,
                "observability.metrics_bind_address",
            )?;
        }
        Ok(())
    }
}
