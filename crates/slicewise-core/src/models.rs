//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 图像句柄（文件路径或URI），对管线不透明
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageHandle(pub String);

impl ImageHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 空间坐标轴
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialAxis {
    X,
    Y,
    Z,
}

impl SpatialAxis {
    pub fn index(self) -> usize {
        match self {
            SpatialAxis::X => 0,
            SpatialAxis::Y => 1,
            SpatialAxis::Z => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpatialAxis::X => "x",
            SpatialAxis::Y => "y",
            SpatialAxis::Z => "z",
        }
    }
}

/// 采集平面
///
/// 没有单独的斜位：斜位采集归入法向量主分量对应的平面，方向缺失或无法判定时为轴位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnatomicalPlane {
    #[default]
    Axial,
    Sagittal,
    Coronal,
}

impl AnatomicalPlane {
    /// 与平面对应的层面坐标轴：矢状位取x，冠状位取y，其余取z
    pub fn axis(self) -> SpatialAxis {
        match self {
            AnatomicalPlane::Sagittal => SpatialAxis::X,
            AnatomicalPlane::Coronal => SpatialAxis::Y,
            AnatomicalPlane::Axial => SpatialAxis::Z,
        }
    }
}

impl fmt::Display for AnatomicalPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnatomicalPlane::Axial => write!(f, "axial"),
            AnatomicalPlane::Sagittal => write!(f, "sagittal"),
            AnatomicalPlane::Coronal => write!(f, "coronal"),
        }
    }
}

/// 显示窗宽窗位
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

impl WindowLevel {
    pub fn new(center: f64, width: f64) -> Self {
        Self { center, width }
    }

    /// 序列未携带默认窗时按设备类型给出的预设
    pub fn preset_for_modality(modality: &str) -> Self {
        match modality.trim().to_ascii_uppercase().as_str() {
            "CT" => Self::new(40.0, 400.0),   // 软组织窗
            "MR" => Self::new(600.0, 1200.0),
            "PT" => Self::new(5.0, 10.0),
            _ => Self::new(127.0, 255.0),
        }
    }
}

/// 采集参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub slice_thickness: Option<f64>,
    pub spacing_between_slices: Option<f64>,
    pub convolution_kernel: Option<String>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    pub pixel_spacing: Option<[f64; 2]>,
    // CT
    pub kvp: Option<f64>,
    pub contrast_agent: Option<String>,
    // MR
    pub magnetic_field_strength: Option<f64>,
    pub echo_time: Option<f64>,
    pub repetition_time: Option<f64>,
}

/// 单张切片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub instance_number: i32,
    pub position: [f64; 3],
    pub orientation: Option<[f64; 6]>,
    pub slice_location: Option<f64>,
    pub image: ImageHandle,
}

impl Slice {
    /// 指定坐标轴上的位置
    pub fn coordinate(&self, axis: SpatialAxis) -> f64 {
        self.position[axis.index()]
    }
}

/// 序列信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub series_uid: String,
    pub series_number: i32,
    pub description: String,
    pub modality: String,
    pub default_window: Option<WindowLevel>,
    pub acquisition: AcquisitionParams,
    pub plane: AnatomicalPlane,
    /// 排序所依据的坐标轴，None 表示所有切片共面、按实例号排序
    pub sort_axis: Option<SpatialAxis>,
    pub coordinate_min: f64,
    pub coordinate_max: f64,
    pub instance_min: i32,
    pub instance_max: i32,
    pub slices: Vec<Slice>,
}

impl Series {
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn instance_bounds(&self) -> InstanceRange {
        InstanceRange::new(self.instance_min, self.instance_max)
    }

    /// 覆盖范围（毫米）
    pub fn coverage_mm(&self) -> f64 {
        (self.coordinate_max - self.coordinate_min).abs()
    }

    /// 用于导出的窗宽窗位：优先序列默认值，其次设备预设
    pub fn effective_window(&self) -> WindowLevel {
        self.default_window
            .unwrap_or_else(|| WindowLevel::preset_for_modality(&self.modality))
    }

    /// 按实例号查找切片在序列中的下标
    pub fn index_of_instance(&self, instance_number: i32) -> Option<usize> {
        self.slices
            .iter()
            .position(|s| s.instance_number == instance_number)
    }

    pub fn display_name(&self) -> String {
        if self.description.trim().is_empty() {
            format!("Series {}", self.series_number)
        } else {
            format!("Series {} ({})", self.series_number, self.description.trim())
        }
    }
}

/// 检查信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Study {
    pub description: String,
    pub modality: String,
    pub patient_age: Option<String>,
    pub patient_sex: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub institution: Option<String>,
    pub scanner: Option<String>,
    /// 主序列UID，空字符串表示没有任何序列
    pub primary_series_uid: String,
    pub series: Vec<Series>,
}

impl Study {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn total_slices(&self) -> usize {
        self.series.iter().map(Series::slice_count).sum()
    }

    pub fn series_by_uid(&self, uid: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.series_uid == uid)
    }

    pub fn primary_series(&self) -> Option<&Series> {
        if self.primary_series_uid.is_empty() {
            return None;
        }
        self.series_by_uid(&self.primary_series_uid)
    }

    /// 按序列号文本（如 "3"、"3.0"、"Series 3"）或UID查找序列
    pub fn find_series(&self, reference: &str) -> Option<&Series> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        if let Some(series) = self.series_by_uid(reference) {
            return Some(series);
        }

        let numeric = reference
            .trim_start_matches(|c: char| !c.is_ascii_digit() && c != '-')
            .trim();
        let number = numeric.parse::<f64>().ok()?;
        self.series
            .iter()
            .find(|s| (s.series_number as f64 - number).abs() < f64::EPSILON)
    }

    /// 提供给推理服务和命令行输出的检查概要
    pub fn digest(&self) -> StudyDigest {
        StudyDigest {
            description: self.description.clone(),
            modality: self.modality.clone(),
            patient_age: self.patient_age.clone(),
            patient_sex: self.patient_sex.clone(),
            study_date: self.study_date,
            institution: self.institution.clone(),
            scanner: self.scanner.clone(),
            primary_series_number: self.primary_series().map(|s| s.series_number),
            series: self
                .series
                .iter()
                .map(|s| SeriesDigest {
                    series_number: s.series_number,
                    description: s.description.clone(),
                    modality: s.modality.clone(),
                    plane: s.plane,
                    slice_count: s.slice_count(),
                    instance_range: s.instance_bounds(),
                    coverage_mm: s.coverage_mm(),
                    slice_thickness: s.acquisition.slice_thickness,
                    default_window: s.default_window,
                })
                .collect(),
        }
    }
}

/// 检查概要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyDigest {
    pub description: String,
    pub modality: String,
    pub patient_age: Option<String>,
    pub patient_sex: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub institution: Option<String>,
    pub scanner: Option<String>,
    pub primary_series_number: Option<i32>,
    pub series: Vec<SeriesDigest>,
}

/// 序列概要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesDigest {
    pub series_number: i32,
    pub description: String,
    pub modality: String,
    pub plane: AnatomicalPlane,
    pub slice_count: usize,
    pub instance_range: InstanceRange,
    pub coverage_mm: f64,
    pub slice_thickness: Option<f64>,
    pub default_window: Option<WindowLevel>,
}

/// 闭区间实例号范围，线上格式为 `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct InstanceRange {
    pub start: i32,
    pub end: i32,
}

impl InstanceRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn is_reversed(&self) -> bool {
        self.start > self.end
    }

    /// 起止颠倒时交换
    pub fn normalized(self) -> Self {
        if self.is_reversed() {
            Self::new(self.end, self.start)
        } else {
            self
        }
    }

    /// 范围内实例号个数（按规范化后的范围计算）
    pub fn len(&self) -> usize {
        let r = self.normalized();
        (r.end as i64 - r.start as i64 + 1) as usize
    }

    pub fn contains(&self, instance_number: i32) -> bool {
        let r = self.normalized();
        r.start <= instance_number && instance_number <= r.end
    }

    /// 规范化后裁剪到给定边界内
    pub fn clamp_to(self, bounds: InstanceRange) -> Self {
        let r = self.normalized();
        let b = bounds.normalized();
        Self::new(r.start.clamp(b.start, b.end), r.end.clamp(b.start, b.end))
    }

    pub fn is_within(&self, bounds: InstanceRange) -> bool {
        let r = self.normalized();
        bounds.contains(r.start) && bounds.contains(r.end)
    }

    pub fn midpoint(&self) -> f64 {
        (self.start as f64 + self.end as f64) / 2.0
    }
}

impl From<[i32; 2]> for InstanceRange {
    fn from(value: [i32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<InstanceRange> for [i32; 2] {
    fn from(value: InstanceRange) -> Self {
        [value.start, value.end]
    }
}

impl fmt::Display for InstanceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// 选片角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesRole {
    Primary,
    Supplementary,
}

/// 采样策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    All,
    EveryNth,
    Uniform,
}

impl SamplingStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "all" => Some(SamplingStrategy::All),
            "every_nth" | "everynth" | "nth" => Some(SamplingStrategy::EveryNth),
            "uniform" | "even" | "evenly" => Some(SamplingStrategy::Uniform),
            _ => None,
        }
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingStrategy::All => write!(f, "all"),
            SamplingStrategy::EveryNth => write!(f, "every_nth"),
            SamplingStrategy::Uniform => write!(f, "uniform"),
        }
    }
}

/// every_nth 未指定步长时的默认值
pub const DEFAULT_EVERY_NTH_STEP: usize = 2;

/// 单个序列的选片描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSelection {
    pub series_number: String,
    pub role: SeriesRole,
    #[serde(default)]
    pub rationale: String,
    pub slice_range: InstanceRange,
    pub sampling_strategy: SamplingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_param: Option<i32>,
    pub window_center: f64,
    pub window_width: f64,
}

impl SeriesSelection {
    pub fn window(&self) -> WindowLevel {
        WindowLevel::new(self.window_center, self.window_width)
    }

    pub fn is_primary(&self) -> bool {
        self.role == SeriesRole::Primary
    }

    /// 预估输出图像数
    ///
    /// all 取范围大小；uniform 取参数并以范围大小为上限；every_nth 取范围大小除以步长向上取整。
    pub fn estimated_count(&self) -> usize {
        let len = self.slice_range.len();
        match self.sampling_strategy {
            SamplingStrategy::All => len,
            SamplingStrategy::Uniform => match self.sampling_param {
                Some(n) if n > 0 => (n as usize).min(len),
                _ => len,
            },
            SamplingStrategy::EveryNth => {
                let step = match self.sampling_param {
                    Some(n) if n > 0 => n as usize,
                    _ => DEFAULT_EVERY_NTH_STEP,
                };
                len.div_ceil(step)
            }
        }
    }
}

/// 多序列选片方案
///
/// `selections` 的第一项为主序列；尾部的标量字段是主序列的镜像，供只处理单序列的调用方使用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPlan {
    #[serde(default)]
    pub reasoning: String,
    pub selections: Vec<SeriesSelection>,
    pub total_images: usize,
    pub series_number: String,
    pub slice_range: InstanceRange,
    pub sampling_strategy: SamplingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_param: Option<i32>,
    pub window_center: f64,
    pub window_width: f64,
}

impl SelectionPlan {
    /// 由选片列表构造方案，并计算总数和主序列镜像
    pub fn new(reasoning: impl Into<String>, selections: Vec<SeriesSelection>) -> Self {
        let mut plan = Self {
            reasoning: reasoning.into(),
            selections,
            total_images: 0,
            series_number: String::new(),
            slice_range: InstanceRange::new(0, 0),
            sampling_strategy: SamplingStrategy::All,
            sampling_param: None,
            window_center: 0.0,
            window_width: 0.0,
        };
        plan.sync_primary_mirror();
        plan
    }

    pub fn primary(&self) -> Option<&SeriesSelection> {
        self.selections.first()
    }

    /// 重新计算总数并同步主序列镜像字段
    pub fn sync_primary_mirror(&mut self) {
        self.total_images = self.estimated_total();
        if let Some(primary) = self.selections.first().cloned() {
            self.series_number = primary.series_number;
            self.slice_range = primary.slice_range;
            self.sampling_strategy = primary.sampling_strategy;
            self.sampling_param = primary.sampling_param;
            self.window_center = primary.window_center;
            self.window_width = primary.window_width;
        }
    }

    pub fn estimated_total(&self) -> usize {
        self.selections.iter().map(SeriesSelection::estimated_count).sum()
    }
}

/// 导出图像与切片的对应关系
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceMapping {
    /// 在本次发送图像中的位置，从1开始
    pub position: usize,
    pub instance_number: i32,
    pub image: ImageHandle,
    pub coordinate: f64,
    pub label: String,
    pub series_number: i32,
    pub series_uid: String,
}

/// 管线步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Error,
}

/// 管线步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub duration_ms: Option<u64>,
}

impl PipelineStep {
    pub fn pending(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            status: StepStatus::Pending,
            detail: None,
            duration_ms: None,
        }
    }
}

/// 单个序列的导出统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub series_number: i32,
    pub image_count: usize,
    pub failed_count: usize,
    pub total_bytes: usize,
}

/// 一次分析运行的管线状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: Uuid,
    pub steps: Vec<PipelineStep>,
    pub plan: Option<SelectionPlan>,
    pub slices_exported: usize,
    pub slices_expected: usize,
    pub exports: Vec<ExportSummary>,
    pub mappings: Vec<SliceMapping>,
}

impl PipelineState {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            steps,
            plan: None,
            slices_exported: 0,
            slices_expected: 0,
            exports: Vec::new(),
            mappings: Vec::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn exported_bytes(&self) -> usize {
        self.exports.iter().map(|e| e.total_bytes).sum()
    }
}

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// 对话轮次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    /// 分析回复所对应的切片映射，用于文本引用跳转
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<SliceMapping>,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            mappings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, mappings: Vec<SliceMapping>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            mappings,
            created_at: Utc::now(),
        }
    }
}
