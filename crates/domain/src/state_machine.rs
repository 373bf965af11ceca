use std::fmt::{Debug, Display};

use trellis_errors::{TrellisError, TrellisResult};

use crate::entities::{DatasetStatus, JobStatus, ModuleStatus, ProcessStatus, TaskStatus};

/// 一次状态写入的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 目标状态与当前状态相同，不写入
    Unchanged,
    Changed,
}

/// 资源状态迁移表
///
/// 迁移表是唯一的合法性来源，各实现用穷尽匹配列出后继状态。
pub trait StateMachine: Copy + Eq + Debug + Display + 'static {
    const RESOURCE: &'static str;

    fn all() -> &'static [Self];

    fn successors(&self) -> &'static [Self];

    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// 进入该状态时是否随同一次写入释放锁
    ///
    /// 出错状态保留锁，由持有者自行释放。
    fn releases_lock(&self) -> bool;

    fn can_transition_to(&self, next: Self) -> bool {
        self.successors().contains(&next)
    }

    fn validate_transition(&self, next: Self) -> TrellisResult<Transition> {
        if *self == next {
            Ok(Transition::Unchanged)
        } else if self.can_transition_to(next) {
            Ok(Transition::Changed)
        } else {
            Err(TrellisError::bad_input(format!(
                "{} 状态不允许从 {} 迁移到 {}",
                Self::RESOURCE,
                self,
                next
            )))
        }
    }

    /// 能一步迁移到 `target` 的全部状态，批量迁移用它作为过滤条件
    fn predecessors(target: Self) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|status| status.can_transition_to(target))
            .collect()
    }
}

impl StateMachine for DatasetStatus {
    const RESOURCE: &'static str = "dataset";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn successors(&self) -> &'static [Self] {
        use DatasetStatus::*;
        match self {
            Created => &[Transferred, Archived, Error],
            Transferred => &[Unpacked, Archived, Error],
            Unpacked => &[Validated, Archived, Error],
            Validated => &[Archived, Error],
            Archived => &[],
            Error => &[],
        }
    }

    fn releases_lock(&self) -> bool {
        matches!(self, DatasetStatus::Archived)
    }
}

impl StateMachine for ModuleStatus {
    const RESOURCE: &'static str = "module";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn successors(&self) -> &'static [Self] {
        use ModuleStatus::*;
        match self {
            Created => &[Transferred, Archived, Error],
            Transferred => &[Active, Archived, Error],
            Active => &[Archived, Error],
            Archived => &[],
            Error => &[],
        }
    }

    fn releases_lock(&self) -> bool {
        matches!(self, ModuleStatus::Archived)
    }
}

impl StateMachine for JobStatus {
    const RESOURCE: &'static str = "job";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn successors(&self) -> &'static [Self] {
        use JobStatus::*;
        match self {
            Scheduled => &[Running, Error],
            Running => &[Pausing, Completed, Terminating, Error],
            Pausing => &[Paused, Resuming, Terminating, Error],
            Paused => &[Resuming, Terminating, Error],
            Resuming => &[Running, Error],
            Completed => &[],
            Terminating => &[Terminated, Error],
            Terminated => &[],
            Error => &[],
        }
    }

    fn releases_lock(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Terminated)
    }
}

impl StateMachine for TaskStatus {
    const RESOURCE: &'static str = "task";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn successors(&self) -> &'static [Self] {
        use TaskStatus::*;
        match self {
            Scheduled => &[Running, Pausing, Terminating, Canceled, Error],
            Running => &[Pausing, Completed, Terminating, Error],
            Pausing => &[Running, Paused, Scheduled, Terminating, Error],
            Paused => &[Running, Scheduled, Terminating, Error],
            Completed => &[],
            Terminating => &[Terminated, Error],
            Terminated => &[],
            Canceled => &[],
            Error => &[],
        }
    }

    fn releases_lock(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Terminated | TaskStatus::Canceled
        )
    }
}

impl StateMachine for ProcessStatus {
    const RESOURCE: &'static str = "process";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn successors(&self) -> &'static [Self] {
        use ProcessStatus::*;
        match self {
            Idle => &[Working, Terminated],
            Working => &[Idle, Terminated],
            Terminated => &[],
        }
    }

    fn releases_lock(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_errors::ErrorKind;

    #[test]
    fn test_same_status_is_unchanged() {
        assert_eq!(
            JobStatus::Running.validate_transition(JobStatus::Running).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            TaskStatus::Error.validate_transition(TaskStatus::Error).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_non_adjacent_transitions_rejected() {
        let err = DatasetStatus::Created
            .validate_transition(DatasetStatus::Validated)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);

        assert!(JobStatus::Completed
            .validate_transition(JobStatus::Running)
            .is_err());
        assert!(TaskStatus::Running
            .validate_transition(TaskStatus::Scheduled)
            .is_err());
        assert!(ModuleStatus::Created
            .validate_transition(ModuleStatus::Active)
            .is_err());
    }

    #[test]
    fn test_every_non_terminal_status_can_fail() {
        fn check<S: StateMachine>(error: S) {
            for status in S::all() {
                if !status.is_terminal() {
                    assert!(status.can_transition_to(error), "{status} -> {error}");
                }
            }
        }
        check(DatasetStatus::Error);
        check(ModuleStatus::Error);
        check(JobStatus::Error);
        check(TaskStatus::Error);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<JobStatus> = JobStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![JobStatus::Completed, JobStatus::Terminated, JobStatus::Error]
        );
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Terminating.is_terminal());
    }

    #[test]
    fn test_error_keeps_lock() {
        assert!(!TaskStatus::Error.releases_lock());
        assert!(!JobStatus::Error.releases_lock());
        assert!(TaskStatus::Completed.releases_lock());
        assert!(JobStatus::Terminated.releases_lock());
    }

    #[test]
    fn test_bulk_predecessors() {
        assert_eq!(
            TaskStatus::predecessors(TaskStatus::Pausing),
            vec![TaskStatus::Scheduled, TaskStatus::Running]
        );
        assert_eq!(
            TaskStatus::predecessors(TaskStatus::Scheduled),
            vec![TaskStatus::Pausing, TaskStatus::Paused]
        );
        assert_eq!(
            TaskStatus::predecessors(TaskStatus::Terminating),
            vec![
                TaskStatus::Scheduled,
                TaskStatus::Running,
                TaskStatus::Pausing,
                TaskStatus::Paused
            ]
        );
    }
}
