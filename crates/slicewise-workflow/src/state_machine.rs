//! 管线状态机
//!
//! 管理一次分析请求的阶段转换，转换函数不依赖任何界面或运行时

use serde::{Deserialize, Serialize};
use slicewise_core::{Result, SlicewiseError};
use std::collections::HashMap;
use std::fmt;

/// 管线阶段
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    Idle,
    Planning,
    AwaitingConfirmation,
    Exporting,
    Analyzing,
    FollowingUp,
    Error,
}

impl PipelinePhase {
    /// 是否有外部调用正在进行或等待确认
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            PipelinePhase::Planning
                | PipelinePhase::AwaitingConfirmation
                | PipelinePhase::Exporting
                | PipelinePhase::Analyzing
                | PipelinePhase::FollowingUp
        )
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Planning => "planning",
            PipelinePhase::AwaitingConfirmation => "awaiting_confirmation",
            PipelinePhase::Exporting => "exporting",
            PipelinePhase::Analyzing => "analyzing",
            PipelinePhase::FollowingUp => "following_up",
            PipelinePhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// 管线事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    Start,
    PlanReady,
    Confirm,
    ExportFinished,
    AnalysisFinished,
    FollowUp,
    FollowUpFinished,
    Fail,
    Cancel,
    Clear,
}

/// 管线状态机
#[derive(Debug)]
pub struct PipelineStateMachine {
    transitions: HashMap<(PipelinePhase, PipelineEvent), PipelinePhase>,
}

impl PipelineStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use PipelineEvent as E;
        use PipelinePhase as P;

        let mut transitions = HashMap::new();

        // 分析主流程
        transitions.insert((P::Idle, E::Start), P::Planning);
        transitions.insert((P::Error, E::Start), P::Planning);
        transitions.insert((P::Planning, E::PlanReady), P::AwaitingConfirmation);
        transitions.insert((P::AwaitingConfirmation, E::Confirm), P::Exporting);
        transitions.insert((P::Exporting, E::ExportFinished), P::Analyzing);
        transitions.insert((P::Analyzing, E::AnalysisFinished), P::Idle);

        // 文字追问
        transitions.insert((P::Idle, E::FollowUp), P::FollowingUp);
        transitions.insert((P::Error, E::FollowUp), P::FollowingUp);
        transitions.insert((P::FollowingUp, E::FollowUpFinished), P::Idle);

        for phase in Self::all_phases() {
            if phase.is_in_flight() {
                transitions.insert((phase, E::Cancel), P::Idle);
                if phase != P::AwaitingConfirmation {
                    transitions.insert((phase, E::Fail), P::Error);
                }
            }
            transitions.insert((phase, E::Clear), P::Idle);
        }

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: &PipelinePhase, event: &PipelineEvent) -> bool {
        self.transitions.contains_key(&(*from, *event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: &PipelinePhase, event: &PipelineEvent) -> Result<PipelinePhase> {
        match self.transitions.get(&(*from, *event)) {
            Some(to) => Ok(*to),
            None => Err(SlicewiseError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取所有阶段
    pub fn all_phases() -> Vec<PipelinePhase> {
        vec![
            PipelinePhase::Idle,
            PipelinePhase::Planning,
            PipelinePhase::AwaitingConfirmation,
            PipelinePhase::Exporting,
            PipelinePhase::Analyzing,
            PipelinePhase::FollowingUp,
            PipelinePhase::Error,
        ]
    }

    /// 获取某阶段下所有可用事件
    pub fn possible_events(&self, current: &PipelinePhase) -> Vec<PipelineEvent> {
        self.transitions
            .keys()
            .filter(|(phase, _)| phase == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for PipelineStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_flow() {
        let sm = PipelineStateMachine::new();
        let mut phase = PipelinePhase::Idle;
        for (event, expected) in [
            (PipelineEvent::Start, PipelinePhase::Planning),
            (PipelineEvent::PlanReady, PipelinePhase::AwaitingConfirmation),
            (PipelineEvent::Confirm, PipelinePhase::Exporting),
            (PipelineEvent::ExportFinished, PipelinePhase::Analyzing),
            (PipelineEvent::AnalysisFinished, PipelinePhase::Idle),
        ] {
            phase = sm.transition(&phase, &event).unwrap();
            assert_eq!(phase, expected);
        }
    }

    #[test]
    fn test_follow_up_flow() {
        let sm = PipelineStateMachine::new();
        assert_eq!(
            sm.transition(&PipelinePhase::Idle, &PipelineEvent::FollowUp).unwrap(),
            PipelinePhase::FollowingUp
        );
        assert_eq!(
            sm.transition(&PipelinePhase::FollowingUp, &PipelineEvent::FollowUpFinished).unwrap(),
            PipelinePhase::Idle
        );
        assert!(!sm.can_transition(&PipelinePhase::Exporting, &PipelineEvent::FollowUp));
    }

    #[test]
    fn test_cancel_and_fail_only_in_flight() {
        let sm = PipelineStateMachine::new();
        for phase in PipelineStateMachine::all_phases() {
            assert_eq!(sm.can_transition(&phase, &PipelineEvent::Cancel), phase.is_in_flight());
            assert_eq!(
                sm.transition(&phase, &PipelineEvent::Clear).unwrap(),
                PipelinePhase::Idle
            );
        }
        assert_eq!(
            sm.transition(&PipelinePhase::Analyzing, &PipelineEvent::Fail).unwrap(),
            PipelinePhase::Error
        );
        assert!(!sm.can_transition(&PipelinePhase::Idle, &PipelineEvent::Fail));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = PipelineStateMachine::new();

        // 方案生成期间不能重新开始，空闲时不能确认
        assert!(!sm.can_transition(&PipelinePhase::Planning, &PipelineEvent::Start));
        let result = sm.transition(&PipelinePhase::Idle, &PipelineEvent::Confirm);
        assert!(matches!(
            result,
            Err(SlicewiseError::InvalidStateTransition { ref from, .. }) if from == "idle"
        ));
        assert_eq!(
            sm.transition(&PipelinePhase::Error, &PipelineEvent::Start).unwrap(),
            PipelinePhase::Planning
        );
    }

    #[test]
    fn test_possible_events() {
        let sm = PipelineStateMachine::new();
        let mut events = sm.possible_events(&PipelinePhase::AwaitingConfirmation);
        events.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(
            events,
            vec![PipelineEvent::Cancel, PipelineEvent::Clear, PipelineEvent::Confirm]
        );
    }
}
