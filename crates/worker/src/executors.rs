use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use trellis_domain::{Stage, StageReport, Task};
use trellis_errors::{TrellisError, TrellisResult};

/// 执行任务的一个流水线阶段
///
/// 实现方只负责阶段本身；阶段之间的状态检查、结果回写与推进由任务执行循环完成。
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, task: &Task, stage: Stage) -> TrellisResult<StageReport>;
}

// stderr 只保留末尾若干行放进状态信息
const STDERR_TAIL_LINES: usize = 20;

/// 阶段执行命令在标准输出最后一行给出的质量指标
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ReportLine {
    quality: Option<f64>,
    quality_train: Option<f64>,
    alt_qualities: Option<Vec<f64>>,
}

/// 以外部命令执行阶段
///
/// 任务信息通过 `TRELLIS_*` 环境变量传给命令；标准输出最后一个非空行若是 JSON 对象，
/// 则解析为质量指标。退出码非零或超时视为阶段失败。
#[derive(Debug, Clone)]
pub struct CommandStageExecutor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandStageExecutor {
    pub fn new(command: &[String], timeout: Option<Duration>) -> TrellisResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TrellisError::config_error("阶段执行命令为空"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn command(&self, task: &Task, stage: Stage) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TRELLIS_TASK_ID", &task.id)
            .env("TRELLIS_JOB_ID", &task.job)
            .env("TRELLIS_STAGE", stage.as_str())
            .env("TRELLIS_MODEL", &task.model)
            .env("TRELLIS_DATASET", &task.dataset)
            .env("TRELLIS_OBJECTIVE", &task.objective)
            .env("TRELLIS_ALT_OBJECTIVES", task.alt_objectives.join(","))
            .env("TRELLIS_CONFIG", &task.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, task: &Task, stage: Stage) -> TrellisResult<StageReport> {
        let mut child = self
            .command(task, stage)
            .spawn()
            .map_err(|e| TrellisError::internal(format!("启动阶段命令 {} 失败: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrellisError::internal("无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TrellisError::internal("无法获取stderr"))?;

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id = %task.id, stage = %stage, "{line}");
                stdout_lines.push(line);
            }
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_lines.push(line);
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let status = child
            .wait()
            .await
            .map_err(|e| TrellisError::internal(format!("等待阶段命令结束失败: {e}")))?;

        if !status.success() {
            let start = stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
            return Err(TrellisError::internal(format!(
                "阶段 {stage} 执行失败，退出码 {:?}: {}",
                status.code(),
                stderr_lines[start..].join("\n")
            )));
        }

        Ok(parse_report(&stdout_lines))
    }
}

fn parse_report(stdout_lines: &[String]) -> StageReport {
    let Some(last) = stdout_lines.iter().rev().find(|l| !l.trim().is_empty()) else {
        return StageReport::default();
    };
    match serde_json::from_str::<ReportLine>(last.trim()) {
        Ok(line) => StageReport {
            quality: line.quality,
            quality_train: line.quality_train,
            alt_qualities: line.alt_qualities,
        },
        Err(e) => {
            warn!(error = %e, "阶段输出的最后一行不是质量指标，忽略");
            StageReport::default()
        }
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, task: &Task, stage: Stage) -> TrellisResult<StageReport> {
        let started = Instant::now();
        info!(task_id = %task.id, stage = %stage, program = %self.program, "执行任务阶段");

        let report = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(task, stage))
                .await
                .map_err(|_| {
                    TrellisError::internal(format!("阶段 {stage} 超过 {}s 未完成", limit.as_secs()))
                })??,
            None => self.run(task, stage).await?,
        };

        let elapsed = started.elapsed();
        metrics::histogram!("trellis_stage_duration_seconds", "stage" => stage.as_str())
            .record(elapsed.as_secs_f64());
        info!(
            task_id = %task.id,
            stage = %stage,
            duration_ms = elapsed.as_millis() as u64,
            quality = ?report.quality,
            "任务阶段执行完成"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_uses_last_line() {
        let lines = vec![
            "epoch 1".to_string(),
            r#"{"quality": 0.8, "alt-qualities": [0.1]}"#.to_string(),
            "".to_string(),
        ];
        let report = parse_report(&lines);
        assert_eq!(report.quality, Some(0.8));
        assert_eq!(report.alt_qualities, Some(vec![0.1]));
        assert!(report.quality_train.is_none());

        let report = parse_report(&["done".to_string()]);
        assert_eq!(report, StageReport::default());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandStageExecutor::new(&[], None).is_err());
    }
}
