//! 管线编排器
//!
//! 协调状态机、推理服务、方案修复、采样、导出和切片寻址的核心引擎。
//! 每次运行持有一个取消令牌：每个等待点之后都会检查令牌，
//! 状态写入也在持锁时再次检查，已取消或已清空的运行不会改动会话状态。

use crate::export::export_series;
use crate::providers::{InferenceProvider, RenderOptions, RenderedImage, SliceRenderer, ViewportContext};
use crate::state_machine::{PipelineEvent, PipelinePhase, PipelineStateMachine};
use slicewise_core::{
    ConversationTurn, ExportSummary, PipelineState, PipelineStep, Result, SelectionPlan,
    SliceMapping, SlicewiseConfig, SlicewiseError, StepStatus, Study, MAX_IMAGES_PER_REQUEST,
};
use slicewise_planning::{
    parse_selection_plan, PlanRepairer, RepairAdjustment, SampledSelection, SliceAddressResolver,
    SliceReference, SliceSampler,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STEP_PLAN: &str = "plan";
const STEP_CONFIRM: &str = "confirm";
const STEP_EXPORT: &str = "export";
const STEP_ANALYZE: &str = "analyze";

/// 编排器配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// 单次请求的图像预算
    pub max_images: usize,
    pub min_supplementary_images: usize,
    pub render: RenderOptions,
    /// 单个序列内的并发渲染数
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_images: MAX_IMAGES_PER_REQUEST,
            min_supplementary_images: 2,
            render: RenderOptions::default(),
            concurrency: 4,
        }
    }
}

impl From<&SlicewiseConfig> for PipelineConfig {
    fn from(config: &SlicewiseConfig) -> Self {
        Self {
            max_images: config.selection.max_images,
            min_supplementary_images: config.selection.min_supplementary_images,
            render: RenderOptions::from(&config.export),
            concurrency: config.export.concurrency,
        }
    }
}

/// 一次运行的结果：正常完成或被取消
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> RunOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Cancelled => None,
        }
    }
}

/// 等待确认的选片方案
#[derive(Debug, Clone, PartialEq)]
pub struct PlanProposal {
    pub run_id: Uuid,
    pub plan: SelectionPlan,
    /// 修复过程中做出的修正
    pub adjustments: Vec<RepairAdjustment>,
}

/// 分析结果，`images` 与 `mappings` 一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub text: String,
    pub mappings: Vec<SliceMapping>,
    pub images: Vec<RenderedImage>,
}

/// 会话状态
#[derive(Debug, Default)]
struct Session {
    phase: PipelinePhase,
    history: Vec<ConversationTurn>,
    pipeline: Option<PipelineState>,
    hint: String,
    /// 当前运行的取消令牌
    run: Option<CancellationToken>,
    /// 当前运行新增的用户轮次下标，取消时回滚
    pending_turn: Option<usize>,
}

impl Session {
    fn abandon_run(&mut self) {
        if let Some(token) = self.run.take() {
            token.cancel();
        }
    }

    fn rollback_pending_turn(&mut self) {
        if let Some(index) = self.pending_turn.take() {
            if index < self.history.len() {
                self.history.remove(index);
            }
        }
    }
}

/// 管线编排器
///
/// 同一时刻只允许一次运行；检查模型在整个生命周期内只读。
pub struct PipelineOrchestrator {
    study: Arc<Study>,
    provider: Arc<dyn InferenceProvider>,
    renderer: Arc<dyn SliceRenderer>,
    config: PipelineConfig,
    state_machine: PipelineStateMachine,
    repairer: PlanRepairer,
    sampler: SliceSampler,
    resolver: SliceAddressResolver,
    session: RwLock<Session>,
}

impl PipelineOrchestrator {
    /// 创建新的编排器
    pub fn new(
        study: Arc<Study>,
        provider: Arc<dyn InferenceProvider>,
        renderer: Arc<dyn SliceRenderer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            repairer: PlanRepairer::new(config.max_images, config.min_supplementary_images),
            sampler: SliceSampler::new(config.max_images),
            resolver: SliceAddressResolver::new(),
            state_machine: PipelineStateMachine::new(),
            session: RwLock::new(Session::default()),
            study,
            provider,
            renderer,
            config,
        }
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub async fn phase(&self) -> PipelinePhase {
        self.session.read().await.phase
    }

    pub async fn pipeline_state(&self) -> Option<PipelineState> {
        self.session.read().await.pipeline.clone()
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.session.read().await.history.clone()
    }

    /// 最近一次分析回复对应的切片映射
    pub async fn last_mappings(&self) -> Vec<SliceMapping> {
        self.session
            .read()
            .await
            .history
            .iter()
            .rev()
            .find(|turn| !turn.mappings.is_empty())
            .map(|turn| turn.mappings.clone())
            .unwrap_or_default()
    }

    /// 把文本中的切片引用解析到最近一次分析的映射上
    pub async fn resolve_references(&self, text: &str) -> Vec<(SliceReference, SliceMapping)> {
        let mappings = self.last_mappings().await;
        self.resolver
            .resolve_text(&mappings, text)
            .into_iter()
            .map(|(reference, mapping)| (reference, mapping.clone()))
            .collect()
    }

    /// 生成并修复选片方案，然后停在等待确认阶段
    pub async fn start(
        &self,
        hint: &str,
        viewport: Option<ViewportContext>,
    ) -> Result<RunOutcome<PlanProposal>> {
        let (token, run_id) = {
            let mut session = self.session.write().await;
            let next = self.state_machine.transition(&session.phase, &PipelineEvent::Start)?;

            let token = CancellationToken::new();
            let mut state = PipelineState::new(Self::default_steps());
            Self::begin_step(&mut state, STEP_PLAN);
            let run_id = state.run_id;

            session.phase = next;
            session.run = Some(token.clone());
            session.hint = hint.to_string();
            session.pending_turn = Some(session.history.len());
            session.history.push(ConversationTurn::user(hint));
            session.pipeline = Some(state);
            (token, run_id)
        };
        info!("运行 {} 开始生成选片方案 (服务: {})", run_id, self.provider.name());

        let started = Instant::now();
        let raw = self
            .provider
            .plan_selection(&self.study, hint, viewport.as_ref())
            .await;
        if token.is_cancelled() {
            debug!("运行 {} 在方案生成后已取消", run_id);
            return Ok(RunOutcome::Cancelled);
        }

        let plan = match raw.and_then(|value| parse_selection_plan(&value, &self.study)) {
            Ok(plan) => plan,
            Err(e) => return self.fail(&token, STEP_PLAN, started, e).await,
        };
        let outcome = self.repairer.repair(&plan, &self.study);
        for adjustment in &outcome.adjustments {
            debug!("方案修正: {}", adjustment);
        }

        let Some(mut session) = self.lock_run(&token).await else {
            return Ok(RunOutcome::Cancelled);
        };
        session.phase = self
            .state_machine
            .transition(&session.phase, &PipelineEvent::PlanReady)?;
        if let Some(state) = session.pipeline.as_mut() {
            Self::finish_step(
                state,
                STEP_PLAN,
                StepStatus::Done,
                Some(format!(
                    "{} 个序列, 预计 {} 张",
                    outcome.plan.selections.len(),
                    outcome.plan.total_images
                )),
                started,
            );
            Self::begin_step(state, STEP_CONFIRM);
            state.slices_expected = outcome.plan.total_images;
            state.plan = Some(outcome.plan.clone());
        }

        info!(
            "运行 {} 方案就绪: {} 个序列, {} 处修正",
            run_id,
            outcome.plan.selections.len(),
            outcome.adjustments.len()
        );
        Ok(RunOutcome::Completed(PlanProposal {
            run_id,
            plan: outcome.plan,
            adjustments: outcome.adjustments,
        }))
    }

    /// 执行确认后的方案：逐序列采样导出，然后一次性提交分析
    pub async fn confirm(&self, plan: SelectionPlan) -> Result<RunOutcome<AnalysisResult>> {
        let outcome = self.repairer.repair(&plan, &self.study);
        if !outcome.is_unchanged() {
            info!("确认的方案经过 {} 处修正", outcome.adjustments.len());
        }
        let plan = outcome.plan;

        let (token, run_id, hint) = {
            let mut session = self.session.write().await;
            let next = self.state_machine.transition(&session.phase, &PipelineEvent::Confirm)?;
            let token = session.run.clone().ok_or(SlicewiseError::NoActivePlan)?;
            let hint = session.hint.clone();
            let state = session.pipeline.as_mut().ok_or(SlicewiseError::NoActivePlan)?;
            let run_id = state.run_id;

            let now = Instant::now();
            Self::finish_step(state, STEP_CONFIRM, StepStatus::Done, None, now);
            Self::begin_step(state, STEP_EXPORT);
            state.slices_expected = plan.total_images;
            state.plan = Some(plan.clone());
            session.phase = next;
            (token, run_id, hint)
        };

        let started = Instant::now();
        let mut mappings: Vec<SliceMapping> = Vec::new();
        let mut images: Vec<RenderedImage> = Vec::new();

        // 采样阶段已按总预算分配，导出数不会超过预算
        let sampled = self.sampler.sample_plan(&self.study, &plan);
        let sampled_total: usize = sampled.iter().map(|s| s.slices.len()).sum();

        for SampledSelection {
            series,
            selection,
            slices,
        } in &sampled
        {
            let Some(export) = export_series(
                self.renderer.as_ref(),
                slices,
                selection.window(),
                &self.config.render,
                self.config.concurrency,
                &token,
            )
            .await
            else {
                debug!("运行 {} 在导出序列 {} 时已取消", run_id, series.series_number);
                return Ok(RunOutcome::Cancelled);
            };

            let series_mappings =
                self.resolver
                    .build_mappings(series, &export.slices, mappings.len() + 1);
            let summary = ExportSummary {
                series_number: series.series_number,
                image_count: export.images.len(),
                failed_count: export.failed.len(),
                total_bytes: export.total_bytes(),
            };

            let Some(mut session) = self.lock_run(&token).await else {
                return Ok(RunOutcome::Cancelled);
            };
            if let Some(state) = session.pipeline.as_mut() {
                state.slices_exported += summary.image_count;
                state.exports.push(summary);
                state.mappings.extend(series_mappings.iter().cloned());
            }
            drop(session);

            mappings.extend(series_mappings);
            images.extend(export.images);
        }

        if sampled_total == 0 {
            let e = SlicewiseError::EmptySelection("方案中没有任何序列产出切片".to_string());
            return self.fail(&token, STEP_EXPORT, started, e).await;
        }
        if images.is_empty() {
            let e = SlicewiseError::ExportFailure(format!("{} 张切片全部渲染失败", sampled_total));
            return self.fail(&token, STEP_EXPORT, started, e).await;
        }
        if images.len() < sampled_total {
            warn!(
                "运行 {} 导出 {} / {} 张，缺失的切片已从映射中剔除",
                run_id,
                images.len(),
                sampled_total
            );
        }

        {
            let Some(mut session) = self.lock_run(&token).await else {
                return Ok(RunOutcome::Cancelled);
            };
            session.phase = self
                .state_machine
                .transition(&session.phase, &PipelineEvent::ExportFinished)?;
            if let Some(state) = session.pipeline.as_mut() {
                let detail = format!("{} 张, {} 字节", images.len(), state.exported_bytes());
                Self::finish_step(state, STEP_EXPORT, StepStatus::Done, Some(detail), started);
                Self::begin_step(state, STEP_ANALYZE);
            }
        }

        let started = Instant::now();
        let labels: Vec<String> = mappings.iter().map(|m| m.label.clone()).collect();
        info!("运行 {} 提交 {} 张图像进行分析", run_id, images.len());
        let analysis = self
            .provider
            .analyze_images(&images, &self.study, &hint, &plan, &labels)
            .await;
        if token.is_cancelled() {
            debug!("运行 {} 在分析后已取消", run_id);
            return Ok(RunOutcome::Cancelled);
        }
        let text = match analysis {
            Ok(text) => text,
            Err(e) => return self.fail(&token, STEP_ANALYZE, started, e).await,
        };

        let Some(mut session) = self.lock_run(&token).await else {
            return Ok(RunOutcome::Cancelled);
        };
        session.phase = self
            .state_machine
            .transition(&session.phase, &PipelineEvent::AnalysisFinished)?;
        if let Some(state) = session.pipeline.as_mut() {
            Self::finish_step(state, STEP_ANALYZE, StepStatus::Done, None, started);
        }
        session
            .history
            .push(ConversationTurn::assistant(text.clone(), mappings.clone()));
        session.run = None;
        session.pending_turn = None;

        info!("运行 {} 完成", run_id);
        Ok(RunOutcome::Completed(AnalysisResult {
            run_id,
            text,
            mappings,
            images,
        }))
    }

    /// 取消当前运行并回滚本次新增的用户轮次
    ///
    /// 取消选片运行时丢弃方案和管线状态；取消追问时保留上一次运行的管线状态。
    pub async fn cancel(&self) -> Result<()> {
        let mut session = self.session.write().await;
        let next = self.state_machine.transition(&session.phase, &PipelineEvent::Cancel)?;
        info!("取消当前运行 (阶段: {})", session.phase);

        session.abandon_run();
        session.rollback_pending_turn();
        if session.phase != PipelinePhase::FollowingUp {
            session.pipeline = None;
        }
        session.phase = next;
        Ok(())
    }

    /// 基于对话历史的文字追问，不改动选片状态
    pub async fn follow_up(&self, text: &str) -> Result<RunOutcome<String>> {
        let (token, history) = {
            let mut session = self.session.write().await;
            let next = self.state_machine.transition(&session.phase, &PipelineEvent::FollowUp)?;
            let token = CancellationToken::new();

            session.phase = next;
            session.run = Some(token.clone());
            session.pending_turn = Some(session.history.len());
            session.history.push(ConversationTurn::user(text));
            (token, session.history.clone())
        };

        let reply = self.provider.continue_conversation(&history, &self.study).await;
        if token.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let Some(mut session) = self.lock_run(&token).await else {
            return Ok(RunOutcome::Cancelled);
        };
        match reply {
            Ok(reply) => {
                session.phase = self
                    .state_machine
                    .transition(&session.phase, &PipelineEvent::FollowUpFinished)?;
                // 追问回复沿用最近一次分析的映射，便于其中的切片引用跳转
                let mappings = session
                    .history
                    .iter()
                    .rev()
                    .find(|turn| !turn.mappings.is_empty())
                    .map(|turn| turn.mappings.clone())
                    .unwrap_or_default();
                session
                    .history
                    .push(ConversationTurn::assistant(reply.clone(), mappings));
                session.run = None;
                session.pending_turn = None;
                Ok(RunOutcome::Completed(reply))
            }
            Err(e) => {
                error!("追问失败: {}", e);
                session.phase = self
                    .state_machine
                    .transition(&session.phase, &PipelineEvent::Fail)?;
                session.run = None;
                session.pending_turn = None;
                Err(e)
            }
        }
    }

    /// 清空会话：丢弃全部历史和进行中的运行
    pub async fn clear(&self) -> Result<()> {
        let mut session = self.session.write().await;
        let next = self.state_machine.transition(&session.phase, &PipelineEvent::Clear)?;

        session.abandon_run();
        session.history.clear();
        session.pipeline = None;
        session.pending_turn = None;
        session.hint.clear();
        session.phase = next;
        info!("会话已清空");
        Ok(())
    }

    /// 持锁并确认运行仍然有效
    async fn lock_run(&self, token: &CancellationToken) -> Option<RwLockWriteGuard<'_, Session>> {
        let session = self.session.write().await;
        if token.is_cancelled() {
            None
        } else {
            Some(session)
        }
    }

    /// 把步骤标记为错误并进入错误阶段；运行已取消时静默丢弃
    async fn fail<T>(
        &self,
        token: &CancellationToken,
        step_id: &str,
        started: Instant,
        error: SlicewiseError,
    ) -> Result<RunOutcome<T>> {
        let Some(mut session) = self.lock_run(token).await else {
            return Ok(RunOutcome::Cancelled);
        };
        error!("步骤 {} 失败: {}", step_id, error);

        session.phase = self
            .state_machine
            .transition(&session.phase, &PipelineEvent::Fail)?;
        if let Some(state) = session.pipeline.as_mut() {
            Self::finish_step(state, step_id, StepStatus::Error, Some(error.to_string()), started);
            state.plan = None;
            state.mappings.clear();
            state.exports.clear();
            state.slices_exported = 0;
        }
        session.run = None;
        session.pending_turn = None;
        Err(error)
    }

    fn default_steps() -> Vec<PipelineStep> {
        vec![
            PipelineStep::pending(STEP_PLAN, "生成选片方案"),
            PipelineStep::pending(STEP_CONFIRM, "确认方案"),
            PipelineStep::pending(STEP_EXPORT, "导出切片"),
            PipelineStep::pending(STEP_ANALYZE, "影像分析"),
        ]
    }

    fn begin_step(state: &mut PipelineState, id: &str) {
        if let Some(step) = state.step_mut(id) {
            step.status = StepStatus::Active;
        }
    }

    fn finish_step(
        state: &mut PipelineState,
        id: &str,
        status: StepStatus,
        detail: Option<String>,
        started: Instant,
    ) {
        if let Some(step) = state.step_mut(id) {
            step.status = status;
            step.detail = detail;
            step.duration_ms = Some(started.elapsed().as_millis() as u64);
        }
    }
}
