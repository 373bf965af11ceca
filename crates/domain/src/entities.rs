use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use trellis_errors::TrellisError;

use crate::pipeline::Stage;

pub const ROOT_USER: &str = "root";

/// 不能被普通创建流程占用的用户标识
pub const RESERVED_USER_IDS: [&str; 3] = [ROOT_USER, "anon", "this"];

/// 定义一个以小写字符串持久化的封闭取值集合
///
/// 未知取值在解析时返回 `BadInput`，不会落到某个默认分支。
macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = TrellisError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(TrellisError::bad_input(format!(
                        concat!(stringify!($name), " 取值无效: {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use vocabulary;

vocabulary!(UserStatus {
    Active => "active",
    Archived => "archived",
});

vocabulary!(
    /// 数据集生命周期状态
    DatasetStatus {
        Created => "created",
        Transferred => "transferred",
        Unpacked => "unpacked",
        Validated => "validated",
        Archived => "archived",
        Error => "error",
    }
);

vocabulary!(DatasetSource {
    Upload => "upload",
    Local => "local",
    Download => "download",
    Git => "git",
});

vocabulary!(
    /// 模块生命周期状态
    ModuleStatus {
        Created => "created",
        Transferred => "transferred",
        Active => "active",
        Archived => "archived",
        Error => "error",
    }
);

vocabulary!(ModuleSource {
    Upload => "upload",
    Local => "local",
    Download => "download",
    Registry => "registry",
});

vocabulary!(ModuleType {
    Model => "model",
    Objective => "objective",
    Optimizer => "optimizer",
});

vocabulary!(
    /// 作业生命周期状态
    JobStatus {
        Scheduled => "scheduled",
        Running => "running",
        Pausing => "pausing",
        Paused => "paused",
        Resuming => "resuming",
        Completed => "completed",
        Terminating => "terminating",
        Terminated => "terminated",
        Error => "error",
    }
);

vocabulary!(
    /// 任务生命周期状态
    TaskStatus {
        Scheduled => "scheduled",
        Running => "running",
        Pausing => "pausing",
        Paused => "paused",
        Completed => "completed",
        Terminating => "terminating",
        Terminated => "terminated",
        Canceled => "canceled",
        Error => "error",
    }
);

vocabulary!(ProcessType {
    Controller => "controller",
    Worker => "worker",
    Scheduler => "scheduler",
});

vocabulary!(ProcessStatus {
    Idle => "idle",
    Working => "working",
    Terminated => "terminated",
});

/// 一段可能尚未开始或尚未结束的时间区间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeInterval {
    /// 起止时间都已记录时的时长
    pub fn duration(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// 已开始的区间截至 `now` 的时长，已结束的区间取结束时间
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.start.map(|start| self.end.unwrap_or(now) - start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: UserStatus,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Dataset {
    pub id: String,
    pub user: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema_in: String,
    #[serde(default)]
    pub schema_out: String,
    pub source: DatasetSource,
    #[serde(default)]
    pub source_address: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,
    pub status: DatasetStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub process: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Module {
    pub id: String,
    pub user: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub schema_in: String,
    #[serde(default)]
    pub schema_out: String,
    #[serde(default)]
    pub config_space: String,
    pub source: ModuleSource,
    #[serde(default)]
    pub source_address: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,
    pub status: ModuleStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub process: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    pub id: String,
    pub user: String,
    pub dataset: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub config_space: String,
    #[serde(default)]
    pub accept_new_models: bool,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub alt_objectives: Vec<String>,
    #[serde(default)]
    pub pipeline: Vec<Stage>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    pub max_tasks: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub running_time: TimeInterval,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub pause_start_time: Option<DateTime<Utc>>,
    /// 此前各次暂停累计的毫秒数
    #[serde(default)]
    pub prev_pause_duration: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub process: Option<String>,
}

impl Job {
    /// 带有预训练任务的作业跳过训练阶段
    pub fn is_pretrained(&self) -> bool {
        !self.task_ids.is_empty()
    }

    pub fn pause_duration(&self, now: DateTime<Utc>) -> Duration {
        let mut total = Duration::milliseconds(self.prev_pause_duration);
        if self.status == JobStatus::Paused {
            if let Some(start) = self.pause_start_time {
                total += now - start;
            }
        }
        total
    }

    /// 扣除暂停时间后的运行时长，作业未开始时为 `None`
    pub fn running_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.running_time
            .elapsed(now)
            .map(|elapsed| elapsed - self.pause_duration(now))
    }
}

/// 任务在各流水线阶段的起止时间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimes {
    #[serde(default)]
    pub train: TimeInterval,
    #[serde(default)]
    pub predict: TimeInterval,
    #[serde(default)]
    pub evaluate: TimeInterval,
}

impl StageTimes {
    pub fn get(&self, stage: Stage) -> Option<&TimeInterval> {
        match stage {
            Stage::Train => Some(&self.train),
            Stage::Predict => Some(&self.predict),
            Stage::Evaluate => Some(&self.evaluate),
            Stage::Begin | Stage::End => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    pub id: String,
    pub job: String,
    #[serde(default)]
    pub process: Option<String>,
    pub user: String,
    pub dataset: String,
    pub model: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub alt_objectives: Vec<String>,
    /// 超参数配置，JSON 文本
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub quality_train: Option<f64>,
    #[serde(default)]
    pub quality_expected: Option<f64>,
    #[serde(default)]
    pub alt_qualities: Vec<f64>,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_message: String,
    pub stage: Stage,
    #[serde(default)]
    pub pipeline: Vec<Stage>,
    #[serde(default)]
    pub stage_times: StageTimes,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,
}

impl Task {
    pub fn stage_duration(&self, stage: Stage) -> Option<Duration> {
        self.stage_times.get(stage).and_then(TimeInterval::duration)
    }

    /// 各已开始阶段耗时之和
    pub fn running_duration(&self, now: DateTime<Utc>) -> Duration {
        Stage::PIPELINE_ELEMENTS
            .iter()
            .filter_map(|stage| self.stage_times.get(*stage))
            .filter_map(|interval| interval.elapsed(now))
            .fold(Duration::zero(), |acc, d| acc + d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Process {
    pub id: String,
    pub process_id: u32,
    pub host_id: String,
    pub host_address: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_keepalive: DateTime<Utc>,
    #[serde(rename = "type")]
    pub process_type: ProcessType,
    pub resource: String,
    pub status: ProcessStatus,
    pub running_ordinal: u32,
}
