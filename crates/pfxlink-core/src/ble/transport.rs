//! 传输层抽象
//!
//! 平台 BLE 协议栈被当作黑盒：所有请求都是非阻塞的，调用只表示
//! "请求是否被接受"，真正的结果通过 [`TransportEvent`] 异步送回。
//! 每个事件都带有发起时的 [`LinkId`]，过期链路的事件由上层丢弃。

use std::fmt;

use crate::ble::{CharHandle, DescriptorHandle, DiscoveredService};

/// 一次连接尝试的标识，每次 `connect` 都会分配新的值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// 写请求的票据，完成回调据此与队头配对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteTicket(pub u64);

impl fmt::Display for WriteTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 特征写模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// GATT 操作完成状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(String),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Failure(reason) => write!(f, "failure ({reason})"),
        }
    }
}

impl<E: fmt::Display> From<Result<(), E>> for GattStatus {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => GattStatus::Success,
            Err(e) => GattStatus::Failure(e.to_string()),
        }
    }
}

/// 传输层异步送回的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        link: LinkId,
    },
    Disconnected {
        link: LinkId,
    },
    ServicesDiscovered {
        link: LinkId,
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicWritten {
        link: LinkId,
        ticket: WriteTicket,
        status: GattStatus,
    },
    DescriptorWritten {
        link: LinkId,
        ticket: WriteTicket,
        status: GattStatus,
    },
    CharacteristicRead {
        link: LinkId,
        handle: CharHandle,
        status: GattStatus,
        value: Vec<u8>,
    },
    Notification {
        link: LinkId,
        handle: CharHandle,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn link(&self) -> LinkId {
        match self {
            TransportEvent::Connected { link }
            | TransportEvent::Disconnected { link }
            | TransportEvent::ServicesDiscovered { link, .. }
            | TransportEvent::CharacteristicWritten { link, .. }
            | TransportEvent::DescriptorWritten { link, .. }
            | TransportEvent::CharacteristicRead { link, .. }
            | TransportEvent::Notification { link, .. } => *link,
        }
    }
}

/// 传输层同步拒绝请求的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapter available")]
    Unavailable,

    #[error("No active link")]
    NotConnected,

    #[error("Transport busy")]
    Busy,

    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// 平台 BLE 协议栈
///
/// 实现者必须立即返回；`Ok` 只表示请求已被接受，结果随后以
/// [`TransportEvent`] 形式送达。同一链路上同时最多只会有一个
/// 描述符写和一个特征写在途，这由上层的写队列保证。
pub trait Transport: Send {
    /// 适配器是否可用
    fn is_available(&self) -> bool;

    /// 发起连接；如果之前的链路仍然存在，上层会先调用 `disconnect`
    fn connect(&mut self, link: LinkId, address: &str) -> Result<(), TransportError>;

    /// 断开或取消一个链路，结果以 `Disconnected` 事件送回
    fn disconnect(&mut self, link: LinkId);

    fn discover_services(&mut self, link: LinkId) -> Result<(), TransportError>;

    fn write_characteristic(
        &mut self,
        link: LinkId,
        ticket: WriteTicket,
        handle: &CharHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &mut self,
        link: LinkId,
        ticket: WriteTicket,
        handle: &DescriptorHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn read_characteristic(&mut self, link: LinkId, handle: &CharHandle)
    -> Result<(), TransportError>;
}
