//! 连接状态机
//!
//! 状态: Disconnected → Connecting → Connected。状态只在传输层事件到达时改变
//! （`connect` 请求本身除外，它立即进入 Connecting）。
//!
//! 每次 `connect` 分配新的 [`LinkId`]；旧链路送回的任何事件都被视为过期并丢弃。

use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::ble::roles::{RoleTable, resolve_roles};
use crate::ble::transport::{GattStatus, LinkId, Transport};
use crate::ble::write_queue::{DescriptorWrite, Step, WriteSerializer};
use crate::ble::{CCCD_UUID, DiscoveredService, ENABLE_NOTIFICATION_VALUE};
use crate::error::PfxError;

/// 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// 服务发现的处理结果
#[derive(Debug)]
pub enum Discovery {
    /// 来自旧链路，已忽略
    Stale,
    /// 状态不是成功，链路保持 Connected 但没有角色
    Failed(String),
    /// 角色已解析，`complete` 表示数据通道是否可用
    Resolved {
        complete: bool,
        notifications: Step<DescriptorWrite>,
    },
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    state: LinkState,
    link: Option<LinkId>,
    address: Option<String>,
    next_link: u64,
    roles: RoleTable,
    discovered: bool,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    /// 当前链路的服务发现是否已经成功完成
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    pub fn is_current(&self, link: LinkId) -> bool {
        self.link == Some(link)
    }

    /// 已连接链路；未连接时返回 `NotConnected`
    pub fn connected_link(&self) -> Result<LinkId, PfxError> {
        match (self.state, self.link) {
            (LinkState::Connected, Some(link)) => Ok(link),
            _ => Err(PfxError::NotConnected),
        }
    }

    /// 发起连接
    ///
    /// 返回 `Ok` 只表示请求已被接受，连接结果随后以事件送达。
    /// 已有的链路（包括仍在 Connecting 的）会先被拆除，写队列清空。
    pub fn connect(
        &mut self,
        transport: &mut dyn Transport,
        writes: &mut WriteSerializer,
        address: &str,
    ) -> Result<LinkId, PfxError> {
        if !transport.is_available() {
            warn!("Bluetooth adapter not initialized");
            return Err(PfxError::TransportUnavailable);
        }
        let address = address.trim();
        if address.is_empty() {
            warn!("Unspecified device address");
            return Err(PfxError::NotReady("device address is empty"));
        }

        if let Some(old) = self.link.take() {
            debug!("Closing existing {} before reconnecting", old);
            transport.disconnect(old);
        }
        writes.reset();
        self.roles.clear();
        self.discovered = false;

        self.next_link += 1;
        let link = LinkId(self.next_link);

        if let Err(e) = transport.connect(link, address) {
            warn!("Connect request for {} rejected: {}", address, e);
            self.state = LinkState::Disconnected;
            return Err(e.into());
        }

        info!("Connecting to {} ({})", address, link);
        self.link = Some(link);
        self.address = Some(address.to_string());
        self.state = LinkState::Connecting;
        Ok(link)
    }

    /// 请求断开；没有活动链路时什么也不做
    ///
    /// 状态在 `Disconnected` 事件到达时才改变。
    pub fn disconnect(&mut self, transport: &mut dyn Transport) -> bool {
        match self.link {
            Some(link) => {
                info!("Disconnecting {}", link);
                transport.disconnect(link);
                true
            }
            None => {
                debug!("Disconnect requested without an active link");
                false
            }
        }
    }

    /// 传输层报告已连接；返回 `false` 表示事件已过期
    pub fn on_connected(
        &mut self,
        link: LinkId,
        transport: &mut dyn Transport,
        writes: &mut WriteSerializer,
    ) -> bool {
        if !self.is_current(link) {
            debug!("Ignoring connected event from stale {}", link);
            return false;
        }

        info!("Connected to GATT server ({})", link);
        self.state = LinkState::Connected;
        // 上一次会话残留的写请求不能带进新会话
        writes.reset();
        self.roles.clear();
        self.discovered = false;

        match transport.discover_services(link) {
            Ok(()) => debug!("Attempting to start service discovery"),
            Err(e) => warn!("Failed to start service discovery: {}", e),
        }
        true
    }

    /// 传输层报告已断开；返回 `false` 表示事件已过期
    pub fn on_disconnected(&mut self, link: LinkId) -> bool {
        if !self.is_current(link) {
            debug!("Ignoring disconnected event from stale {}", link);
            return false;
        }

        info!("Disconnected from GATT server ({})", link);
        self.state = LinkState::Disconnected;
        self.link = None;
        self.roles.clear();
        self.discovered = false;
        true
    }

    /// 服务发现完成：解析角色并为数据特征开启通知
    pub fn on_services_discovered(
        &mut self,
        link: LinkId,
        status: &GattStatus,
        services: &[DiscoveredService],
        transport: &mut dyn Transport,
        writes: &mut WriteSerializer,
    ) -> Discovery {
        if !self.is_current(link) || self.state != LinkState::Connected {
            debug!("Ignoring service discovery result from stale {}", link);
            return Discovery::Stale;
        }

        if let GattStatus::Failure(reason) = status {
            warn!("Service discovery failed: {}", reason);
            return Discovery::Failed(reason.clone());
        }

        self.roles = resolve_roles(services);
        self.discovered = true;
        let complete = self.roles.is_complete();
        info!(
            "Discovered {} service(s), resolved roles: {:?}",
            services.len(),
            self.roles.roles()
        );

        let mut notifications = Step::default();
        let targets: Vec<_> = self.roles.notify_characteristics().copied().collect();
        for c in targets {
            if !c.has_cccd {
                warn!("Characteristic {} has no CCCD, notifications stay off", c.uuid());
                continue;
            }
            let step = writes.enqueue_descriptor_write(
                transport,
                link,
                c.handle.descriptor(CCCD_UUID),
                ENABLE_NOTIFICATION_VALUE.to_vec(),
            );
            notifications.retry = notifications.retry.or(step.retry);
            notifications.dropped.extend(step.dropped);
        }

        Discovery::Resolved {
            complete,
            notifications,
        }
    }
}
