//! 外部协作接口
//!
//! 推理服务和切片渲染都由调用方实现，管线只依赖这里的特征

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slicewise_core::{
    ConversationTurn, ExportConfig, Result, SelectionPlan, Slice, Study, WindowLevel,
};

/// 推理服务
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// 服务名称，用于日志
    fn name(&self) -> &str;

    /// 根据检查概况和临床问题生成选片方案，返回未经校验的原始输出
    async fn plan_selection(
        &self,
        study: &Study,
        hint: &str,
        viewport: Option<&ViewportContext>,
    ) -> Result<Value>;

    /// 分析导出的图像，`labels` 与 `images` 一一对应
    async fn analyze_images(
        &self,
        images: &[RenderedImage],
        study: &Study,
        hint: &str,
        plan: &SelectionPlan,
        labels: &[String],
    ) -> Result<String>;

    /// 基于完整对话历史的文字追问
    async fn continue_conversation(
        &self,
        history: &[ConversationTurn],
        study: &Study,
    ) -> Result<String>;
}

/// 切片渲染
#[async_trait]
pub trait SliceRenderer: Send + Sync {
    /// 按给定窗宽窗位把单张切片渲染为压缩图像
    async fn render_slice(
        &self,
        slice: &Slice,
        window: WindowLevel,
        options: &RenderOptions,
    ) -> Result<RenderedImage>;
}

/// 请求时查看器的状态，帮助推理服务理解用户正在看什么
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportContext {
    pub series_uid: Option<String>,
    pub series_number: Option<i32>,
    pub instance_number: Option<i32>,
    pub window: Option<WindowLevel>,
}

/// 渲染参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    /// 输出长边像素上限
    pub max_long_edge: u32,
    /// 压缩质量 (1-100)
    pub quality: u8,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

impl From<&ExportConfig> for RenderOptions {
    fn from(config: &ExportConfig) -> Self {
        Self {
            max_long_edge: config.max_long_edge,
            quality: config.quality,
        }
    }
}

/// 渲染后的图像
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedImage {
    pub instance_number: i32,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl RenderedImage {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
