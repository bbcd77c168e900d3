//! 逐文件原始标签记录

use serde::{Deserialize, Serialize};
use slicewise_core::{AcquisitionParams, ImageHandle, WindowLevel};

/// 单个DICOM文件中与建模相关的原始标签
///
/// 所有字段都可能缺失，由 [`crate::StudyModelBuilder`] 负责补齐默认值。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawInstanceRecord {
    // 检查信息
    pub study_description: Option<String>,
    pub study_date: Option<String>,
    pub patient_age: Option<String>,
    pub patient_sex: Option<String>,
    pub institution_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_model_name: Option<String>,

    // 序列信息
    pub series_instance_uid: Option<String>,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub acquisition: AcquisitionParams,

    // 实例信息
    pub instance_number: Option<i32>,
    pub image_position: Option<[f64; 3]>,
    pub image_orientation: Option<[f64; 6]>,
    pub slice_location: Option<f64>,
    pub image: ImageHandle,
}

impl RawInstanceRecord {
    /// 分组键，缺少序列UID的文件归入 "unknown"
    pub fn series_key(&self) -> &str {
        self.series_instance_uid
            .as_deref()
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .unwrap_or("unknown")
    }

    /// 文件自带的显示窗，宽度必须为正
    pub fn window(&self) -> Option<WindowLevel> {
        match (self.window_center, self.window_width) {
            (Some(center), Some(width)) if width > 0.0 => Some(WindowLevel::new(center, width)),
            _ => None,
        }
    }

    /// 扫描设备名称（厂商 + 型号）
    pub fn scanner(&self) -> Option<String> {
        let parts: Vec<&str> = [self.manufacturer.as_deref(), self.manufacturer_model_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}
