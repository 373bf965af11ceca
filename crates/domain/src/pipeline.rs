use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use trellis_errors::{TrellisError, TrellisResult};

use crate::entities::vocabulary;

vocabulary!(
    /// 任务所处的流水线阶段，`begin` 与 `end` 是哨兵
    Stage {
        Begin => "begin",
        Train => "train",
        Predict => "predict",
        Evaluate => "evaluate",
        End => "end",
    }
);

impl Stage {
    /// 允许出现在作业流水线里的阶段
    pub const PIPELINE_ELEMENTS: [Stage; 3] = [Stage::Train, Stage::Predict, Stage::Evaluate];

    pub fn is_pipeline_element(&self) -> bool {
        Self::PIPELINE_ELEMENTS.contains(self)
    }
}

/// 阶段前置关系图，构造时校验无环，之后只读共享
#[derive(Debug, Clone)]
pub struct StageGraph {
    prerequisites: BTreeMap<Stage, BTreeSet<Stage>>,
}

impl StageGraph {
    pub fn new<I>(edges: I) -> TrellisResult<Self>
    where
        I: IntoIterator<Item = (Stage, Vec<Stage>)>,
    {
        let mut prerequisites: BTreeMap<Stage, BTreeSet<Stage>> = Stage::PIPELINE_ELEMENTS
            .iter()
            .map(|stage| (*stage, BTreeSet::new()))
            .collect();

        for (stage, required) in edges {
            if !stage.is_pipeline_element() {
                return Err(TrellisError::config_error(format!(
                    "阶段 {stage} 不能声明前置阶段"
                )));
            }
            for prerequisite in required {
                if !prerequisite.is_pipeline_element() {
                    return Err(TrellisError::config_error(format!(
                        "阶段 {stage} 的前置阶段 {prerequisite} 不是流水线阶段"
                    )));
                }
                prerequisites.entry(stage).or_default().insert(prerequisite);
            }
        }

        let graph = Self { prerequisites };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// 训练无前置；预测依赖训练；评估依赖训练与预测
    pub fn standard() -> TrellisResult<Self> {
        Self::new([
            (Stage::Train, vec![]),
            (Stage::Predict, vec![Stage::Train]),
            (Stage::Evaluate, vec![Stage::Train, Stage::Predict]),
        ])
    }

    pub fn prerequisites(&self, stage: Stage) -> impl Iterator<Item = Stage> + '_ {
        self.prerequisites
            .get(&stage)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    // Kahn 拓扑排序，剩余未出队的节点即在环上
    fn check_acyclic(&self) -> TrellisResult<()> {
        let mut remaining: BTreeMap<Stage, usize> = self
            .prerequisites
            .iter()
            .map(|(stage, required)| (*stage, required.len()))
            .collect();
        let mut ready: Vec<Stage> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(stage, _)| *stage)
            .collect();

        while let Some(done) = ready.pop() {
            remaining.remove(&done);
            for (stage, required) in &self.prerequisites {
                if required.contains(&done) {
                    if let Some(count) = remaining.get_mut(stage) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(*stage);
                        }
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(())
        } else {
            let cycle: Vec<&str> = remaining.keys().map(Stage::as_str).collect();
            Err(TrellisError::config_error(format!(
                "阶段前置关系存在环: {}",
                cycle.join(", ")
            )))
        }
    }

    /// 校验并补全作业流水线
    ///
    /// 空流水线按是否预训练取默认值。从左到右检查，每个阶段的前置阶段必须已出现在它左侧；
    /// 预训练模式下训练与预测阶段视为已满足，来源任务已完成并带有预测结果。
    pub fn validate_pipeline(&self, pipeline: &[Stage], pretrained: bool) -> TrellisResult<Vec<Stage>> {
        if pipeline.is_empty() {
            return Ok(if pretrained {
                vec![Stage::Predict, Stage::Evaluate]
            } else {
                vec![Stage::Train, Stage::Predict, Stage::Evaluate]
            });
        }

        let mut satisfied = BTreeSet::new();
        if pretrained {
            satisfied.insert(Stage::Train);
            satisfied.insert(Stage::Predict);
        }

        let mut seen = BTreeSet::new();
        for stage in pipeline {
            if !stage.is_pipeline_element() {
                return Err(TrellisError::bad_input(format!(
                    "流水线中不允许出现阶段 {stage}"
                )));
            }
            if !seen.insert(*stage) {
                return Err(TrellisError::bad_input(format!("流水线中阶段 {stage} 重复")));
            }
            if let Some(missing) = self.prerequisites(*stage).find(|p| !satisfied.contains(p)) {
                return Err(TrellisError::bad_input(format!(
                    "阶段 {stage} 需要先完成阶段 {missing}"
                )));
            }
            satisfied.insert(*stage);
        }

        Ok(pipeline.to_vec())
    }

    /// 把文本形式的流水线解析后再校验
    pub fn parse_pipeline(&self, elements: &[String], pretrained: bool) -> TrellisResult<Vec<Stage>> {
        let stages = elements
            .iter()
            .map(|element| element.parse::<Stage>())
            .collect::<TrellisResult<Vec<_>>>()?;
        self.validate_pipeline(&stages, pretrained)
    }
}

/// 根据作业流水线求下一阶段
///
/// `begin` 之后是流水线首个阶段；当前阶段是最后一个或不在流水线内时进入 `end`。
pub fn next_stage(current: Stage, pipeline: &[Stage]) -> Stage {
    match current {
        Stage::Begin => pipeline.first().copied().unwrap_or(Stage::End),
        Stage::End => Stage::End,
        Stage::Train | Stage::Predict | Stage::Evaluate => pipeline
            .iter()
            .position(|stage| *stage == current)
            .and_then(|index| pipeline.get(index + 1))
            .copied()
            .unwrap_or(Stage::End),
    }
}

pub fn requires_evaluation(pipeline: &[Stage]) -> bool {
    pipeline.contains(&Stage::Evaluate)
}
