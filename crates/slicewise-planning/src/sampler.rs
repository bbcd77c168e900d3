//! 切片采样
//!
//! 把有序切片列表确定性地缩减为有上限的子集，输出保持输入顺序

use slicewise_core::{
    InstanceRange, SamplingStrategy, SelectionPlan, Series, SeriesSelection, Slice, Study,
    DEFAULT_EVERY_NTH_STEP, MAX_IMAGES_PER_REQUEST,
};
use tracing::{debug, warn};

/// 取出实例号落在范围内的切片；一张都没有时退回整个序列
pub fn select_range(series: &Series, range: InstanceRange) -> Vec<&Slice> {
    let selected: Vec<&Slice> = series
        .slices
        .iter()
        .filter(|s| range.contains(s.instance_number))
        .collect();
    if selected.is_empty() {
        warn!(
            "序列 {} 的范围 {} 没有匹配的切片，改用整个序列",
            series.series_number, range
        );
        return series.slices.iter().collect();
    }
    selected
}

/// 选片对应的序列；序列不存在时改用主序列
pub fn selection_series<'a>(study: &'a Study, selection: &SeriesSelection) -> Option<&'a Series> {
    study.find_series(&selection.series_number).or_else(|| {
        warn!("序列 {} 不存在，改用主序列", selection.series_number);
        study.primary_series()
    })
}

/// 方案中一个选片的采样结果
#[derive(Debug, Clone)]
pub struct SampledSelection<'a> {
    pub series: &'a Series,
    pub selection: &'a SeriesSelection,
    pub slices: Vec<Slice>,
}

/// 均匀抽样下标：`round(i·(len−1)/(count−1))`，首尾必选
///
/// `count >= len` 时返回全部下标；`count == 1` 时取中间一张。
pub fn uniform_indices(len: usize, count: usize) -> Vec<usize> {
    if len == 0 || count == 0 {
        return Vec::new();
    }
    if count >= len {
        return (0..len).collect();
    }
    if count == 1 {
        return vec![(len - 1) / 2];
    }
    let span = (len - 1) as f64;
    let steps = (count - 1) as f64;
    (0..count)
        .map(|i| (i as f64 * span / steps).round() as usize)
        .collect()
}

/// 切片采样器
#[derive(Debug, Clone)]
pub struct SliceSampler {
    budget: usize,
}

impl Default for SliceSampler {
    fn default() -> Self {
        Self::new(MAX_IMAGES_PER_REQUEST)
    }
}

impl SliceSampler {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// 按策略采样，最后以预算为硬上限再做一次均匀抽样
    pub fn sample<T: Clone>(
        &self,
        items: &[T],
        strategy: SamplingStrategy,
        param: Option<i32>,
    ) -> Vec<T> {
        let positive = param.filter(|p| *p > 0).map(|p| p as usize);

        let sampled: Vec<T> = match strategy {
            SamplingStrategy::All => items.to_vec(),
            SamplingStrategy::EveryNth => {
                let step = positive.unwrap_or(DEFAULT_EVERY_NTH_STEP);
                items.iter().step_by(step).cloned().collect()
            }
            SamplingStrategy::Uniform => {
                let count = positive.unwrap_or_else(|| self.budget.min(items.len()));
                pick(items, &uniform_indices(items.len(), count))
            }
        };

        if sampled.len() > self.budget {
            debug!(
                "采样结果 {} 张超出预算 {}，均匀抽样到预算",
                sampled.len(),
                self.budget
            );
            return pick(&sampled, &uniform_indices(sampled.len(), self.budget));
        }
        sampled
    }

    /// 对一个序列执行选片：先按范围取切片，再按策略采样
    pub fn sample_selection(&self, series: &Series, selection: &SeriesSelection) -> Vec<Slice> {
        let candidates: Vec<Slice> = select_range(series, selection.slice_range)
            .into_iter()
            .cloned()
            .collect();
        let sampled = self.sample(&candidates, selection.sampling_strategy, selection.sampling_param);
        debug!(
            "序列 {}: 范围 {} 内 {} 张, {}({:?}) 采样得到 {} 张",
            series.series_number,
            selection.slice_range,
            candidates.len(),
            selection.sampling_strategy,
            selection.sampling_param,
            sampled.len()
        );
        sampled
    }

    /// 对整个方案采样，所有选片合计不超过预算
    ///
    /// 选片按方案顺序占用剩余预算，预算用尽后的选片被跳过；
    /// 找不到序列也没有主序列的选片被跳过。
    pub fn sample_plan<'a>(&self, study: &'a Study, plan: &'a SelectionPlan) -> Vec<SampledSelection<'a>> {
        let mut remaining = self.budget;
        let mut sampled = Vec::new();
        for selection in &plan.selections {
            if remaining == 0 {
                warn!("图像预算已用尽，跳过序列 {}", selection.series_number);
                continue;
            }
            let Some(series) = selection_series(study, selection) else {
                warn!("检查中没有可用序列，跳过选片 {}", selection.series_number);
                continue;
            };

            let slices = SliceSampler::new(remaining).sample_selection(series, selection);
            if slices.is_empty() {
                continue;
            }
            remaining -= slices.len();
            sampled.push(SampledSelection {
                series,
                selection,
                slices,
            });
        }
        sampled
    }
}

fn pick<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}
