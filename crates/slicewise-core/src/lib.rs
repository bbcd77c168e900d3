//! # Slicewise Core
//!
//! 选片管线的核心模块，提供基础数据结构、错误定义、配置和通用工具。

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::{ConfigValidator, ExportConfig, LoggingConfig, SelectionConfig, SlicewiseConfig};
pub use error::{Result, SlicewiseError};
pub use models::*;

/// 单次分析请求允许发送的最大图像数
pub const MAX_IMAGES_PER_REQUEST: usize = 20;
