//! 选片方案修复
//!
//! 把不可信的选片方案按检查的真实几何和全局图像预算修复为可安全执行的方案。
//! 所有修正都是可恢复的调整，只记录日志，不作为错误返回。

use slicewise_core::{
    InstanceRange, SamplingStrategy, SelectionPlan, SeriesRole, SeriesSelection, Study,
    MAX_IMAGES_PER_REQUEST,
};
use std::fmt;
use tracing::{debug, info, warn};

/// 一次修正动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAdjustment {
    /// 方案引用的序列不存在，原样保留
    SeriesNotFound { series_number: String },
    RangeSwapped {
        series_number: String,
        original: InstanceRange,
    },
    RangeClamped {
        series_number: String,
        from: InstanceRange,
        to: InstanceRange,
    },
    /// all 策略超出预算，改为 uniform
    StrategyForcedUniform { series_number: String, count: usize },
    SamplingParamDefaulted { series_number: String, value: usize },
    SamplingParamClamped {
        series_number: String,
        from: i32,
        to: usize,
    },
    SupplementaryReduced {
        series_number: String,
        from: usize,
        to: usize,
    },
    SelectionDropped { series_number: String },
    PrimaryForcedToBudget { series_number: String, count: usize },
}

impl fmt::Display for RepairAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SeriesNotFound { series_number } => {
                write!(f, "序列 {} 不存在，保留原选片", series_number)
            }
            Self::RangeSwapped {
                series_number,
                original,
            } => write!(f, "序列 {} 的范围 {} 起止颠倒，已交换", series_number, original),
            Self::RangeClamped {
                series_number,
                from,
                to,
            } => write!(f, "序列 {} 的范围 {} 裁剪为 {}", series_number, from, to),
            Self::StrategyForcedUniform {
                series_number,
                count,
            } => write!(f, "序列 {} 的 all 策略超出预算，改为 uniform({})", series_number, count),
            Self::SamplingParamDefaulted {
                series_number,
                value,
            } => write!(f, "序列 {} 的 uniform 参数缺失，默认为 {}", series_number, value),
            Self::SamplingParamClamped {
                series_number,
                from,
                to,
            } => write!(f, "序列 {} 的 uniform 参数 {} 裁剪为 {}", series_number, from, to),
            Self::SupplementaryReduced {
                series_number,
                from,
                to,
            } => write!(f, "辅助序列 {} 从 {} 张压缩为 {} 张", series_number, from, to),
            Self::SelectionDropped { series_number } => {
                write!(f, "序列 {} 因超出预算被移除", series_number)
            }
            Self::PrimaryForcedToBudget {
                series_number,
                count,
            } => write!(f, "主序列 {} 强制为 uniform({})", series_number, count),
        }
    }
}

/// 修复结果
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub plan: SelectionPlan,
    pub adjustments: Vec<RepairAdjustment>,
}

impl RepairOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.adjustments.is_empty()
    }
}

/// 选片方案修复器
#[derive(Debug, Clone)]
pub struct PlanRepairer {
    budget: usize,
    min_supplementary: usize,
}

impl Default for PlanRepairer {
    fn default() -> Self {
        Self::new(MAX_IMAGES_PER_REQUEST, 2)
    }
}

impl PlanRepairer {
    /// 创建修复器
    ///
    /// `budget` 为全局图像预算，`min_supplementary` 为压缩辅助序列时每个序列保留的最少张数。
    pub fn new(budget: usize, min_supplementary: usize) -> Self {
        Self {
            budget,
            min_supplementary,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// 修复方案，返回新方案和修正记录，不修改输入
    pub fn repair(&self, plan: &SelectionPlan, study: &Study) -> RepairOutcome {
        let mut adjustments = Vec::new();

        let mut selections: Vec<SeriesSelection> = plan
            .selections
            .iter()
            .map(|selection| self.repair_selection(selection, study, &mut adjustments))
            .collect();

        self.enforce_budget(&mut selections, &mut adjustments);

        let mut repaired = plan.clone();
        repaired.selections = selections;
        repaired.sync_primary_mirror();

        if adjustments.is_empty() {
            debug!("选片方案无需修复, 预估 {} 张", repaired.total_images);
        } else {
            info!(
                "选片方案已修复: {} 处调整, 预估 {} → {} 张",
                adjustments.len(),
                plan.estimated_total(),
                repaired.total_images
            );
        }

        RepairOutcome {
            plan: repaired,
            adjustments,
        }
    }

    /// 单个选片的修复：裁剪范围、修正采样策略和参数
    fn repair_selection(
        &self,
        selection: &SeriesSelection,
        study: &Study,
        adjustments: &mut Vec<RepairAdjustment>,
    ) -> SeriesSelection {
        let mut repaired = selection.clone();
        let series_number = selection.series_number.clone();

        let Some(series) = study.find_series(&selection.series_number) else {
            warn!("选片引用的序列 {} 不存在，跳过修复", series_number);
            adjustments.push(RepairAdjustment::SeriesNotFound { series_number });
            return repaired;
        };

        let original = selection.slice_range;
        if original.is_reversed() {
            self.record(
                adjustments,
                RepairAdjustment::RangeSwapped {
                    series_number: series_number.clone(),
                    original,
                },
            );
        }
        let clamped = original.clamp_to(series.instance_bounds());
        if clamped != original.normalized() {
            self.record(
                adjustments,
                RepairAdjustment::RangeClamped {
                    series_number: series_number.clone(),
                    from: original.normalized(),
                    to: clamped,
                },
            );
        }
        repaired.slice_range = clamped;

        let len = clamped.len();
        let cap = len.min(self.budget);
        match repaired.sampling_strategy {
            SamplingStrategy::All if len > self.budget => {
                repaired.sampling_strategy = SamplingStrategy::Uniform;
                repaired.sampling_param = Some(self.budget as i32);
                self.record(
                    adjustments,
                    RepairAdjustment::StrategyForcedUniform {
                        series_number,
                        count: self.budget,
                    },
                );
            }
            SamplingStrategy::Uniform => match repaired.sampling_param {
                Some(n) if n > 0 && n as usize > cap => {
                    repaired.sampling_param = Some(cap as i32);
                    self.record(
                        adjustments,
                        RepairAdjustment::SamplingParamClamped {
                            series_number,
                            from: n,
                            to: cap,
                        },
                    );
                }
                Some(n) if n > 0 => {}
                _ => {
                    repaired.sampling_param = Some(cap as i32);
                    self.record(
                        adjustments,
                        RepairAdjustment::SamplingParamDefaulted {
                            series_number,
                            value: cap,
                        },
                    );
                }
            },
            _ => {}
        }

        repaired
    }

    /// 全局预算：先压缩辅助序列，再移除辅助序列，最后强制主序列
    fn enforce_budget(
        &self,
        selections: &mut Vec<SeriesSelection>,
        adjustments: &mut Vec<RepairAdjustment>,
    ) {
        let mut total: usize = selections.iter().map(SeriesSelection::estimated_count).sum();
        if total <= self.budget {
            return;
        }
        debug!("预估 {} 张超出预算 {}，开始压缩", total, self.budget);

        // 1. 从后往前压缩辅助序列，每个不少于 min_supplementary 张
        for selection in selections.iter_mut().rev() {
            if total <= self.budget {
                break;
            }
            if selection.role != SeriesRole::Supplementary {
                continue;
            }
            let current = selection.estimated_count();
            let excess = total - self.budget;
            let target = current
                .saturating_sub(excess)
                .max(self.min_supplementary)
                .min(selection.slice_range.len());
            if target >= current {
                continue;
            }

            selection.sampling_strategy = SamplingStrategy::Uniform;
            selection.sampling_param = Some(target as i32);
            total = total - current + target;
            self.record(
                adjustments,
                RepairAdjustment::SupplementaryReduced {
                    series_number: selection.series_number.clone(),
                    from: current,
                    to: target,
                },
            );
        }
        if total <= self.budget {
            return;
        }

        // 2. 只保留主序列（第一项始终保留）
        let mut index = 0;
        selections.retain(|selection| {
            let keep = index == 0 || selection.role == SeriesRole::Primary;
            index += 1;
            if !keep {
                self.record(
                    adjustments,
                    RepairAdjustment::SelectionDropped {
                        series_number: selection.series_number.clone(),
                    },
                );
            }
            keep
        });
        total = selections.iter().map(SeriesSelection::estimated_count).sum();
        if total <= self.budget {
            warn!("已移除全部辅助序列，剩余 {} 张", total);
            return;
        }

        // 3. 多个主序列仍超预算时只保留第一项，超预算的主序列强制为 uniform(预算)
        for dropped in selections.drain(1..) {
            self.record(
                adjustments,
                RepairAdjustment::SelectionDropped {
                    series_number: dropped.series_number,
                },
            );
        }
        if let Some(primary) = selections.first_mut() {
            if primary.estimated_count() > self.budget {
                let count = self.budget.min(primary.slice_range.len());
                primary.sampling_strategy = SamplingStrategy::Uniform;
                primary.sampling_param = Some(count as i32);
                self.record(
                    adjustments,
                    RepairAdjustment::PrimaryForcedToBudget {
                        series_number: primary.series_number.clone(),
                        count,
                    },
                );
            }
        }
    }

    fn record(&self, adjustments: &mut Vec<RepairAdjustment>, adjustment: RepairAdjustment) {
        warn!("方案修正: {}", adjustment);
        adjustments.push(adjustment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{study_with, SeriesSpec};

    fn selection(
        series: &str,
        role: SeriesRole,
        range: (i32, i32),
        strategy: SamplingStrategy,
        param: Option<i32>,
    ) -> SeriesSelection {
        SeriesSelection {
            series_number: series.to_string(),
            role,
            rationale: String::new(),
            slice_range: InstanceRange::new(range.0, range.1),
            sampling_strategy: strategy,
            sampling_param: param,
            window_center: 40.0,
            window_width: 400.0,
        }
    }

    fn study() -> Study {
        study_with(&[
            SeriesSpec::axial(2, 200),
            SeriesSpec::axial(3, 300),
            SeriesSpec::sagittal(4, 60),
        ])
    }

    fn assert_invariants(outcome: &RepairOutcome, study: &Study) {
        assert!(outcome.plan.total_images <= MAX_IMAGES_PER_REQUEST);
        for selection in &outcome.plan.selections {
            if let Some(series) = study.find_series(&selection.series_number) {
                assert!(selection.slice_range.is_within(series.instance_bounds()));
            }
        }
    }

    #[test]
    fn test_valid_plan_unchanged() {
        let study = study();
        let plan = SelectionPlan::new(
            "ok",
            vec![selection("2", SeriesRole::Primary, (1, 200), SamplingStrategy::Uniform, Some(15))],
        );

        let outcome = PlanRepairer::default().repair(&plan, &study);
        assert!(outcome.is_unchanged());
        assert_eq!(outcome.plan, plan);
        assert_eq!(outcome.plan.total_images, 15);

        // 再次修复结果不变
        let again = PlanRepairer::default().repair(&outcome.plan, &study);
        assert_eq!(again.plan, outcome.plan);
    }

    #[test]
    fn test_single_slice_range() {
        let study = study();
        let plan = SelectionPlan::new(
            "one",
            vec![selection("3", SeriesRole::Primary, (90, 90), SamplingStrategy::All, None)],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);
        assert!(outcome.is_unchanged());
        assert_eq!(outcome.plan.total_images, 1);
    }

    #[test]
    fn test_range_swapped_and_clamped() {
        let study = study();
        let plan = SelectionPlan::new(
            "r",
            vec![selection("2", SeriesRole::Primary, (250, 190), SamplingStrategy::All, None)],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);

        assert_eq!(outcome.plan.selections[0].slice_range, InstanceRange::new(190, 200));
        assert_eq!(outcome.plan.slice_range, InstanceRange::new(190, 200));
        assert!(outcome
            .adjustments
            .iter()
            .any(|a| matches!(a, RepairAdjustment::RangeSwapped { .. })));
        assert!(outcome
            .adjustments
            .iter()
            .any(|a| matches!(a, RepairAdjustment::RangeClamped { .. })));
        assert_invariants(&outcome, &study);
    }

    #[test]
    fn test_all_over_budget_forced_uniform() {
        let study = study();
        let plan = SelectionPlan::new(
            "all",
            vec![selection("2", SeriesRole::Primary, (1, 100), SamplingStrategy::All, None)],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);
        let primary = &outcome.plan.selections[0];

        assert_eq!(primary.sampling_strategy, SamplingStrategy::Uniform);
        assert_eq!(primary.sampling_param, Some(20));
        assert_eq!(outcome.plan.sampling_strategy, SamplingStrategy::Uniform);
        assert_eq!(outcome.plan.total_images, 20);
    }

    #[test]
    fn test_uniform_param_defaults_and_clamps() {
        let study = study();
        let plan = SelectionPlan::new(
            "u",
            vec![
                selection("2", SeriesRole::Primary, (1, 8), SamplingStrategy::Uniform, None),
                selection("3", SeriesRole::Supplementary, (1, 5), SamplingStrategy::Uniform, Some(9)),
            ],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);

        assert_eq!(outcome.plan.selections[0].sampling_param, Some(8));
        assert_eq!(outcome.plan.selections[1].sampling_param, Some(5));

        let plan = SelectionPlan::new(
            "u",
            vec![selection("2", SeriesRole::Primary, (1, 200), SamplingStrategy::Uniform, Some(-3))],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);
        assert_eq!(outcome.plan.selections[0].sampling_param, Some(20));
    }

    #[test]
    fn test_supplementary_reduced_to_fit() {
        let study = study();
        let plan = SelectionPlan::new(
            "two",
            vec![
                selection("2", SeriesRole::Primary, (1, 200), SamplingStrategy::Uniform, Some(15)),
                selection("3", SeriesRole::Supplementary, (100, 109), SamplingStrategy::All, None),
            ],
        );
        assert_eq!(plan.total_images, 25);

        let outcome = PlanRepairer::default().repair(&plan, &study);
        let supplementary = &outcome.plan.selections[1];
        assert_eq!(supplementary.sampling_strategy, SamplingStrategy::Uniform);
        assert_eq!(supplementary.sampling_param, Some(5));
        assert_eq!(outcome.plan.total_images, 20);
        assert_eq!(outcome.plan.selections[0].sampling_param, Some(15));
        assert_invariants(&outcome, &study);
    }

    #[test]
    fn test_supplementary_reduced_in_reverse_order() {
        let study = study();
        let plan = SelectionPlan::new(
            "three",
            vec![
                selection("2", SeriesRole::Primary, (1, 200), SamplingStrategy::Uniform, Some(14)),
                selection("3", SeriesRole::Supplementary, (1, 300), SamplingStrategy::Uniform, Some(6)),
                selection("4", SeriesRole::Supplementary, (1, 60), SamplingStrategy::Uniform, Some(6)),
            ],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);

        // 末尾的辅助序列先被压到下限 2，再压缩前一个
        assert_eq!(outcome.plan.selections[2].sampling_param, Some(2));
        assert_eq!(outcome.plan.selections[1].sampling_param, Some(4));
        assert_eq!(outcome.plan.total_images, 20);
    }

    #[test]
    fn test_supplementary_dropped_when_floor_not_enough() {
        let study = study();
        let plan = SelectionPlan::new(
            "tight",
            vec![
                selection("2", SeriesRole::Primary, (1, 19), SamplingStrategy::All, None),
                selection("3", SeriesRole::Supplementary, (1, 300), SamplingStrategy::Uniform, Some(8)),
            ],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);

        assert_eq!(outcome.plan.selections.len(), 1);
        assert_eq!(outcome.plan.total_images, 19);
        assert!(outcome
            .adjustments
            .iter()
            .any(|a| matches!(a, RepairAdjustment::SelectionDropped { .. })));
    }

    #[test]
    fn test_primary_forced_to_budget() {
        let study = study();
        let plan = SelectionPlan::new(
            "nth",
            vec![selection("3", SeriesRole::Primary, (1, 300), SamplingStrategy::EveryNth, Some(5))],
        );
        let outcome = PlanRepairer::new(20, 2).repair(&plan, &study);
        let primary = &outcome.plan.selections[0];

        assert_eq!(primary.sampling_strategy, SamplingStrategy::Uniform);
        assert_eq!(primary.sampling_param, Some(20));
        assert_eq!(outcome.plan.total_images, 20);
    }

    #[test]
    fn test_missing_series_passed_through() {
        let study = study();
        let plan = SelectionPlan::new(
            "missing",
            vec![selection("99", SeriesRole::Primary, (500, 400), SamplingStrategy::All, None)],
        );
        let outcome = PlanRepairer::default().repair(&plan, &study);

        assert_eq!(outcome.plan.selections[0].slice_range, InstanceRange::new(500, 400));
        assert_eq!(
            outcome.adjustments[0],
            RepairAdjustment::SeriesNotFound {
                series_number: "99".to_string()
            }
        );
    }

    #[test]
    fn test_input_plan_not_mutated() {
        let study = study();
        let plan = SelectionPlan::new(
            "all",
            vec![selection("2", SeriesRole::Primary, (1, 200), SamplingStrategy::All, None)],
        );
        let snapshot = plan.clone();
        let _ = PlanRepairer::default().repair(&plan, &study);
        assert_eq!(plan, snapshot);
    }
}
