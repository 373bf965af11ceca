use std::net::UdpSocket;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use trellis_errors::{TrellisError, TrellisResult};

use crate::entities::{Process, ProcessStatus, ProcessType};
use crate::query::{FieldKind, Filter, Identity, ListQuery, Page, SortOrder, SortSpec};
use crate::repositories::DocumentUpdate;
use crate::services::locks::{LockManager, ReleasedLocks};
use crate::services::repository::Repository;
use crate::services::update_with_retry;
use crate::state_machine::{StateMachine, Transition};

const MAX_ORDINAL_ATTEMPTS: u32 = 32;

/// 当前进程所在主机的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHost {
    pub process_id: u32,
    pub host_id: String,
    pub host_address: String,
}

impl ProcessHost {
    pub fn detect() -> Self {
        let host_id = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            process_id: std::process::id(),
            host_id,
            host_address: outbound_address(),
        }
    }
}

// 连接 UDP 套接字只会选路，不会发出数据
fn outbound_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|e| {
            warn!(error = %e, "无法确定出口地址，使用回环地址");
            "127.0.0.1".to_string()
        })
}

/// 被判定死亡的进程及回收的锁
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedProcess {
    pub process: Process,
    pub released: ReleasedLocks,
}

/// 进程注册、保活与死亡回收
#[derive(Clone)]
pub struct ProcessRegistry {
    processes: Repository<Process>,
    locks: LockManager,
}

impl ProcessRegistry {
    pub fn new(processes: Repository<Process>, locks: LockManager) -> Self {
        Self { processes, locks }
    }

    /// 注册进程并分配同类进程中最小的空闲序号
    ///
    /// 插入后检查是否有行号更小的同类进程持有相同序号；有则让出并重新计算。
    pub async fn register(
        &self,
        host: &ProcessHost,
        process_type: ProcessType,
        resource: &str,
    ) -> TrellisResult<Process> {
        let root = Identity::root();
        let now = Utc::now();
        let mut ordinal = self.lowest_free_ordinal(process_type).await?;

        let process = Process {
            id: uuid::Uuid::new_v4().to_string(),
            process_id: host.process_id,
            host_id: host.host_id.clone(),
            host_address: host.host_address.clone(),
            start_time: now,
            last_keepalive: now,
            process_type,
            resource: resource.to_string(),
            status: ProcessStatus::Idle,
            running_ordinal: ordinal,
        };
        let mut current = self.processes.insert(&process).await?.value;

        for _ in 0..MAX_ORDINAL_ATTEMPTS {
            let holders = self
                .processes
                .find_all(
                    &root,
                    vec![
                        Filter::eq("type", process_type.as_str()),
                        Filter::ne("status", ProcessStatus::Terminated.as_str()),
                        Filter::eq("running-ordinal", ordinal),
                    ],
                    SortSpec::default(),
                )
                .await?;

            if holders.first().map(|p| p.id.as_str()) == Some(current.id.as_str()) {
                info!(
                    process_id = %current.id,
                    process_type = %process_type,
                    ordinal,
                    host = %current.host_id,
                    "进程注册完成"
                );
                return Ok(current);
            }

            ordinal = self.lowest_free_ordinal(process_type).await?;
            debug!(process_id = %current.id, ordinal, "序号已被占用，改用下一个空闲序号");
            current = self
                .processes
                .update_by_id(
                    &root,
                    &current.id,
                    None,
                    &DocumentUpdate::new().set("running-ordinal", ordinal),
                )
                .await?
                .ok_or_else(|| TrellisError::not_found(format!("process {}", current.id)))?
                .value;
        }

        Err(TrellisError::storage(format!(
            "进程 {} 未能获得运行序号",
            current.id
        )))
    }

    async fn lowest_free_ordinal(&self, process_type: ProcessType) -> TrellisResult<u32> {
        let active = self
            .processes
            .find_all(
                &Identity::root(),
                vec![
                    Filter::eq("type", process_type.as_str()),
                    Filter::ne("status", ProcessStatus::Terminated.as_str()),
                ],
                SortSpec::by("running-ordinal", FieldKind::Integer, SortOrder::Asc),
            )
            .await?;

        let mut ordinal = 1;
        for process in active {
            if process.running_ordinal == ordinal {
                ordinal += 1;
            } else if process.running_ordinal > ordinal {
                break;
            }
        }
        Ok(ordinal)
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<Process> {
        self.processes.get(identity, id).await
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<Process>> {
        self.processes.list(identity, query, vec![], None).await
    }

    /// 刷新保活时间，已被判定死亡的进程返回 `NotFound`
    pub async fn keepalive(&self, id: &str) -> TrellisResult<Process> {
        let update =
            DocumentUpdate::new().set("last-keepalive", Utc::now().timestamp_millis());
        self.processes
            .update_first(
                &Identity::root(),
                vec![
                    Filter::eq("id", id),
                    Filter::ne("status", ProcessStatus::Terminated.as_str()),
                ],
                &SortSpec::default(),
                &update,
            )
            .await?
            .map(|versioned| versioned.value)
            .ok_or_else(|| TrellisError::not_found(format!("活动进程 {id}")))
    }

    pub async fn set_status(&self, id: &str, status: ProcessStatus) -> TrellisResult<Process> {
        let (process, _) = update_with_retry(&self.processes, &Identity::root(), id, |current| {
            Ok(match current.status.validate_transition(status)? {
                Transition::Unchanged => DocumentUpdate::new(),
                Transition::Changed => DocumentUpdate::new().set("status", status.as_str()),
            })
        })
        .await?;
        Ok(process)
    }

    /// 进程正常退出：释放它持有的锁并标记为终止
    ///
    /// 先释放再标记，释放失败时进程仍未终止，之后的回收会再次处理它。
    pub async fn terminate(&self, id: &str) -> TrellisResult<ReleasedLocks> {
        let released = self.locks.release_all_held_by(id).await?;
        self.set_status(id, ProcessStatus::Terminated).await?;
        info!(process_id = id, released = released.total(), "进程已注销");
        Ok(released)
    }

    /// 回收保活时间早于 `cutoff` 的进程
    ///
    /// 对每个过期进程先释放它持有的非出错资源的锁，再按条件把它标记为终止。
    /// 释放失败时直接返回错误，进程保持未终止，下一轮回收会重新处理。
    /// 标记时进程已被别的回收者终止或重新保活，则不计入本轮结果。
    pub async fn reclaim_dead(&self, cutoff: DateTime<Utc>) -> TrellisResult<Vec<ReclaimedProcess>> {
        let root = Identity::root();
        let expired = || {
            vec![
                Filter::lt("last-keepalive", cutoff.timestamp_millis()),
                Filter::ne("status", ProcessStatus::Terminated.as_str()),
            ]
        };
        let update = DocumentUpdate::new().set("status", ProcessStatus::Terminated.as_str());

        let candidates = self
            .processes
            .find_all(&root, expired(), SortSpec::default())
            .await?;
        let mut reclaimed = Vec::new();

        for candidate in candidates {
            let released = self.locks.release_all_held_by(&candidate.id).await?;

            let mut filters = expired();
            filters.push(Filter::eq("id", candidate.id.as_str()));
            let Some(dead) = self
                .processes
                .update_first(&root, filters, &SortSpec::default(), &update)
                .await?
            else {
                debug!(process_id = %candidate.id, "进程已被其他回收者处理或重新保活");
                continue;
            };

            metrics::counter!("trellis_processes_reclaimed_total").increment(1);
            warn!(
                process_id = %dead.value.id,
                process_type = %dead.value.process_type,
                host = %dead.value.host_id,
                last_keepalive = %dead.value.last_keepalive,
                released = released.total(),
                "进程保活超时，已判定死亡"
            );
            reclaimed.push(ReclaimedProcess {
                process: dead.value,
                released,
            });
        }

        Ok(reclaimed)
    }
}
