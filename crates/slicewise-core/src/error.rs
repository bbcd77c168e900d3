//! 错误定义模块

use thiserror::Error;

/// 选片管线统一错误类型
#[derive(Error, Debug)]
pub enum SlicewiseError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("DICOM解析错误: {0}")]
    Dicom(String),

    /// 推理服务返回的选片方案无法解析或缺少必要字段
    #[error("选片方案格式错误: {0}（请尝试更具体的问题或更换推理服务）")]
    MalformedPlanResponse(String),

    /// 修复后的方案没有选中任何切片
    #[error("未选中任何切片: {0}（请调整问题后重试）")]
    EmptySelection(String),

    /// 所有切片导出均失败
    #[error("切片导出失败: {0}")]
    ExportFailure(String),

    /// 推理服务通信失败（网络、超时、鉴权等），原样透出
    #[error("推理服务错误: {0}")]
    Provider(String),

    #[error("当前没有待确认的选片方案")]
    NoActivePlan,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, SlicewiseError>;
