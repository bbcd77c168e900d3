//! # 选片方案模块
//!
//! 负责把推理服务给出的选片方案变成可安全执行的结果，包括：
//! - 方案解析：把自由格式的服务输出规整为类型化的选片方案
//! - 方案修复：按真实几何和图像预算裁剪、改写方案
//! - 切片采样：按采样策略确定性地抽取切片
//! - 切片寻址：为导出图像生成标签，并把文本中的切片引用解析回具体图像

pub mod address;
pub mod navigation;
pub mod plan;
pub mod repair;
pub mod sampler;

pub use address::{ReferenceKind, SliceAddressResolver, SliceReference};
pub use navigation::{navigate_to, Viewport};
pub use plan::{parse_selection_plan, RawPlanResponse, RawSelection};
pub use repair::{PlanRepairer, RepairAdjustment, RepairOutcome};
pub use sampler::{select_range, selection_series, uniform_indices, SampledSelection, SliceSampler};

#[cfg(test)]
pub(crate) mod testing;
