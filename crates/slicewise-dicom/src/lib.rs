//! # DICOM 检查建模模块
//!
//! 提供从逐文件标签到 Study → Series → Slice 层级模型的构建，包括：
//! - 方位分类：由方向余弦判定采集平面
//! - 检查模型构建：分组、空间排序、几何统计与主序列选择
//! - 文件解析：从DICOM文件提取构建所需的标签

pub mod orientation;
pub mod parser;
pub mod record;
pub mod study_builder;

pub use orientation::{classify_plane, slice_normal};
pub use parser::DicomParser;
pub use record::RawInstanceRecord;
pub use study_builder::StudyModelBuilder;
