//! 配置管理
//!
//! 从配置文件和 `SLICEWISE__` 前缀的环境变量加载管线配置

use crate::error::{Result, SlicewiseError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// 完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicewiseConfig {
    /// 选片配置
    pub selection: SelectionConfig,
    /// 导出配置
    pub export: ExportConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 选片配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// 单次请求的图像预算
    pub max_images: usize,
    /// 预算压缩时辅助序列保留的最少图像数
    pub min_supplementary_images: usize,
}

/// 导出配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// 输出图像长边像素上限
    pub max_long_edge: u32,
    /// 压缩质量 (1-100)
    pub quality: u8,
    /// 单个序列内的并发渲染数
    pub concurrency: usize,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志过滤表达式，如 "info" 或 "slicewise_planning=debug"
    pub level: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_images: crate::MAX_IMAGES_PER_REQUEST,
            min_supplementary_images: 2,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_long_edge: 1024,
            quality: 85,
            concurrency: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SlicewiseConfig {
    /// 从文件加载配置，文件不存在时使用默认值，环境变量优先级最高
    pub fn load<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            let path = path.as_ref();
            debug!("加载配置文件: {:?}", path);
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("SLICEWISE").separator("__").try_parsing(true))
            .build()
            .map_err(|e| SlicewiseError::Config(e.to_string()))?;

        let config: SlicewiseConfig = settings
            .try_deserialize()
            .map_err(|e| SlicewiseError::Config(format!("Failed to deserialize configuration: {}", e)))?;

        ConfigValidator::new().validate(&config)?;
        info!(
            "Configuration loaded: max_images={}, export_concurrency={}",
            config.selection.max_images, config.export.concurrency
        );
        Ok(config)
    }
}

/// 配置验证器
#[derive(Debug, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// 验证配置
    pub fn validate(&self, config: &SlicewiseConfig) -> Result<()> {
        if config.selection.max_images == 0 {
            return Err(SlicewiseError::Config("selection.max_images 必须大于0".to_string()));
        }
        if config.selection.min_supplementary_images > config.selection.max_images {
            return Err(SlicewiseError::Config(
                "selection.min_supplementary_images 不能超过 selection.max_images".to_string(),
            ));
        }
        if config.export.concurrency == 0 {
            return Err(SlicewiseError::Config("export.concurrency 必须大于0".to_string()));
        }
        if config.export.max_long_edge == 0 {
            return Err(SlicewiseError::Config("export.max_long_edge 必须大于0".to_string()));
        }
        if !(1..=100).contains(&config.export.quality) {
            return Err(SlicewiseError::Config("export.quality 必须在1到100之间".to_string()));
        }
        Ok(())
    }
}
