//! # 分析管线模块
//!
//! 编排一次完整的影像分析请求，包括：
//! - 管线状态机：纯函数式的阶段转换表
//! - 外部协作接口：推理服务与切片渲染
//! - 切片导出：单序列内有界并发渲染
//! - 管线编排器：生成方案、等待确认、导出、分析以及后续追问，支持协作式取消

pub mod export;
pub mod orchestrator;
pub mod providers;
pub mod state_machine;

// 重新导出主要类型
pub use export::{export_series, SeriesExport};
pub use orchestrator::{AnalysisResult, PipelineConfig, PipelineOrchestrator, PlanProposal, RunOutcome};
pub use providers::{InferenceProvider, RenderOptions, RenderedImage, SliceRenderer, ViewportContext};
pub use state_machine::{PipelineEvent, PipelinePhase, PipelineStateMachine};
