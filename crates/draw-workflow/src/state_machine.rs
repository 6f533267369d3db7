//! 处理状态机
//!
//! 管理系列处理记录的完整生命周期状态转换。单次流水线运行内
//! 状态只向前走；唯一的回退路径是操作员显式触发的重启。

use std::collections::HashMap;

use draw_core::{DrawError, ProcessingStatus, Result};

/// 处理状态机
#[derive(Debug)]
pub struct ProcessingStateMachine {
    transitions: HashMap<ProcessingStatus, Vec<ProcessingStatus>>,
}

impl ProcessingStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use ProcessingStatus::*;

        let mut transitions: HashMap<ProcessingStatus, Vec<ProcessingStatus>> = HashMap::new();

        // 定义状态转换规则
        transitions.insert(
            SeriesSeparated,
            vec![
                TemplateNotMatched,
                MultipleTemplatesMatched,
                MultipleTemplatesFound,
                NoTemplateFound,
                ReadyForDeidentification,
                Error,
            ],
        );
        transitions.insert(
            ReadyForDeidentification,
            vec![Deidentified, DeidentificationFailed, Error],
        );
        transitions.insert(
            Deidentified,
            vec![RtstructExported, RtstructExportFailed, Error],
        );

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: ProcessingStatus, to: ProcessingStatus) -> bool {
        self.transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// 执行状态转换
    pub fn transition(&self, from: ProcessingStatus, to: ProcessingStatus) -> Result<ProcessingStatus> {
        if self.can_transition(from, to) {
            Ok(to)
        } else {
            Err(DrawError::InvalidStateTransition {
                from: from.as_str().to_string(),
                event: to.as_str().to_string(),
            })
        }
    }

    /// 操作员重启的回退目标
    ///
    /// 只有吸收性的失败状态可以重启；进行中的状态返回 None。
    pub fn restart_target(status: ProcessingStatus) -> Option<ProcessingStatus> {
        use ProcessingStatus::*;
        match status {
            TemplateNotMatched | MultipleTemplatesMatched | MultipleTemplatesFound
            | NoTemplateFound | Error => Some(SeriesSeparated),
            DeidentificationFailed => Some(ReadyForDeidentification),
            RtstructExportFailed => Some(Deidentified),
            _ => None,
        }
    }
}

impl Default for ProcessingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessingStatus::*;

    #[test]
    fn test_valid_transitions() {
        let sm = ProcessingStateMachine::new();

        assert!(sm.can_transition(SeriesSeparated, ReadyForDeidentification));
        assert!(sm.can_transition(SeriesSeparated, MultipleTemplatesMatched));
        assert!(sm.can_transition(ReadyForDeidentification, Deidentified));
        assert!(sm.can_transition(Deidentified, RtstructExported));
    }

    #[test]
    fn test_no_silent_rollback() {
        let sm = ProcessingStateMachine::new();

        // 向后的转换一律非法
        assert!(!sm.can_transition(Deidentified, SeriesSeparated));
        assert!(!sm.can_transition(ReadyForDeidentification, SeriesSeparated));
        assert!(!sm.can_transition(RtstructExported, Deidentified));
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let sm = ProcessingStateMachine::new();
        let result = sm.transition(NoTemplateFound, Deidentified);
        assert!(matches!(
            result,
            Err(DrawError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_restart_targets() {
        assert_eq!(
            ProcessingStateMachine::restart_target(NoTemplateFound),
            Some(SeriesSeparated)
        );
        assert_eq!(
            ProcessingStateMachine::restart_target(DeidentificationFailed),
            Some(ReadyForDeidentification)
        );
        assert_eq!(
            ProcessingStateMachine::restart_target(RtstructExportFailed),
            Some(Deidentified)
        );
        // 进行中与已完成的状态不可重启
        assert_eq!(ProcessingStateMachine::restart_target(Deidentified), None);
        assert_eq!(ProcessingStateMachine::restart_target(RtstructExported), None);
    }
}
