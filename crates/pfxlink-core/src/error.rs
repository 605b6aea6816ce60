//! 错误类型
//!
//! 链路层与应用层共用的错误分类。回调路径上的错误只记录日志，
//! 不会向上传播；这里的错误只返回给主动发起请求的调用方。

use crate::ble::roles::Role;
use crate::ble::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum PfxError {
    /// 没有可用的蓝牙适配器
    #[error("Bluetooth transport unavailable")]
    TransportUnavailable,

    /// 请求参数不满足连接条件（例如地址为空）
    #[error("Not ready: {0}")]
    NotReady(&'static str),

    /// 当前没有活动链路
    #[error("Not connected")]
    NotConnected,

    /// 传输层拒绝了写请求（重试一次后仍失败）
    #[error("Write rejected: {0}")]
    WriteRejected(TransportError),

    /// 服务发现返回了非成功状态
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// 目标角色在服务发现中没有解析出来
    #[error("Role unavailable: {0}")]
    RoleUnavailable(Role),

    /// 会话任务已经退出
    #[error("Session closed")]
    SessionClosed,

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for PfxError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable => PfxError::TransportUnavailable,
            TransportError::NotConnected => PfxError::NotConnected,
            other => PfxError::Transport(other),
        }
    }
}
