//! 会话状态机
//!
//! [`LinkCore`] 持有连接状态机、写队列、响应重组器和命令调度器，
//! 每个传输层事件和调用方请求都是它上面的一次同步状态转换。
//! 它自己不做任何异步操作：需要上报的事件和需要延迟执行的重试
//! 都放进 outbox，由外层的会话任务取走处理。

use log::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::connection::{ConnectionManager, Discovery, LinkState};
use crate::ble::roles::{Role, RoleTable};
use crate::ble::transport::{GattStatus, LinkId, Transport, TransportEvent, WriteTicket};
use crate::ble::write_queue::{Completion, QueueKind, Step, WriteRequest, WriteSerializer};
use crate::ble::{CharHandle, DiscoveredService};
use crate::error::PfxError;
use crate::pfx::protocol::{self, hex};
use crate::pfx::{CommandDispatcher, Dispatch, PfxResponse, ResponseCorrelator};
use crate::session::store::{BrickInfo, GattValueStore};

/// 向上层报告的会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        address: String,
    },
    Disconnected,
    /// 服务发现成功；`complete` 表示数据通道可用
    DiscoveryComplete {
        complete: bool,
        roles: Vec<Role>,
    },
    DiscoveryFailed {
        reason: String,
    },
    /// 读到的特征值或收到的通知
    DataAvailable {
        characteristic: Uuid,
        role: Option<Role>,
        value: Vec<u8>,
    },
    ResponseReady(PfxResponse),
    WriteCompleted {
        kind: QueueKind,
    },
    WriteFailed {
        kind: QueueKind,
        reason: String,
    },
    /// 命令和读取队列都已处理完
    QueueIdle,
}

/// outbox 中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Event(SessionEvent),
    /// 延迟后对这个写请求调用 [`LinkCore::retry_write`]
    RetryWrite {
        kind: QueueKind,
        link: LinkId,
        ticket: WriteTicket,
    },
}

pub struct LinkCore<T> {
    transport: T,
    connection: ConnectionManager,
    writes: WriteSerializer,
    correlator: ResponseCorrelator,
    dispatcher: CommandDispatcher,
    values: GattValueStore,
    info: BrickInfo,
    auto_query: bool,
    /// 调度器当前在途命令对应的写票据
    command_ticket: Option<WriteTicket>,
    /// 自上次 `QueueIdle` 以来是否调度过
    dispatch_active: bool,
    outbox: Vec<Output>,
}

impl<T: Transport> LinkCore<T> {
    pub fn new(transport: T, auto_query: bool) -> Self {
        Self {
            transport,
            connection: ConnectionManager::new(),
            writes: WriteSerializer::new(),
            correlator: ResponseCorrelator::new(),
            dispatcher: CommandDispatcher::new(),
            values: GattValueStore::new(),
            info: BrickInfo::default(),
            auto_query,
            command_ticket: None,
            dispatch_active: false,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.connection.state()
    }

    pub fn link(&self) -> Option<LinkId> {
        self.connection.link()
    }

    pub fn address(&self) -> Option<&str> {
        self.connection.address()
    }

    pub fn roles(&self) -> &RoleTable {
        self.connection.roles()
    }

    pub fn brick_info(&self) -> &BrickInfo {
        &self.info
    }

    pub fn gatt_values(&self) -> &GattValueStore {
        &self.values
    }

    pub fn writes(&self) -> &WriteSerializer {
        &self.writes
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// 取走累积的输出
    pub fn drain_outbox(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    pub fn connect(&mut self, address: &str) -> Result<LinkId, PfxError> {
        let previous = self.connection.state();
        match self
            .connection
            .connect(&mut self.transport, &mut self.writes, address)
        {
            Ok(link) => {
                self.reset_link_state();
                self.values.clear();
                self.info = BrickInfo::default();
                Ok(link)
            }
            Err(e) => {
                // 旧链路已经拆除，但新的连接请求没有被接受
                if previous != LinkState::Disconnected
                    && self.connection.state() == LinkState::Disconnected
                {
                    self.reset_link_state();
                    self.emit(SessionEvent::Disconnected);
                }
                Err(e)
            }
        }
    }

    pub fn disconnect(&mut self) -> bool {
        self.connection.disconnect(&mut self.transport)
    }

    /// 命令入队，经调度器按顺序发送
    pub fn push_command(&mut self, command: Vec<u8>) -> Result<(), PfxError> {
        self.connection.connected_link()?;
        debug!("Queue command {}", hex(&command));
        self.dispatcher.push(command);
        self.pump_dispatcher();
        Ok(())
    }

    /// 绕过调度器，直接写入命令特征
    pub fn send_command(&mut self, command: Vec<u8>) -> Result<(), PfxError> {
        let link = self.connection.connected_link()?;
        let target = self.connection.roles().command_target()?;
        let (handle, mode) = (target.handle, target.write_mode);

        let step =
            self.writes
                .enqueue_characteristic_write(&mut self.transport, link, handle, command, mode);
        self.handle_step(link, step);
        Ok(())
    }

    /// 读取某个角色对应的特征，结果以 `DataAvailable` 送达
    pub fn read_characteristic(&mut self, role: Role) -> Result<(), PfxError> {
        self.connection.connected_link()?;
        let handle = self.connection.roles().characteristic(role)?.handle;
        self.dispatcher.queue_read(handle);
        self.pump_dispatcher();
        Ok(())
    }

    /// 读取设备信息服务并查询名称和状态
    pub fn query_device_info(&mut self) -> Result<(), PfxError> {
        self.connection.connected_link()?;
        if !self.connection.is_discovered() {
            return Err(PfxError::NotReady("service discovery has not completed"));
        }
        self.queue_device_info();
        self.pump_dispatcher();
        Ok(())
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { link } => {
                if self
                    .connection
                    .on_connected(link, &mut self.transport, &mut self.writes)
                {
                    self.reset_link_state();
                    let address = self.connection.address().unwrap_or_default().to_string();
                    self.emit(SessionEvent::Connected { address });
                }
            }
            TransportEvent::Disconnected { link } => {
                if self.connection.on_disconnected(link) {
                    self.reset_link_state();
                    self.emit(SessionEvent::Disconnected);
                }
            }
            TransportEvent::ServicesDiscovered {
                link,
                status,
                services,
            } => self.on_services_discovered(link, &status, &services),
            TransportEvent::CharacteristicWritten {
                link,
                ticket,
                status,
            } => self.on_characteristic_written(link, ticket, status),
            TransportEvent::DescriptorWritten {
                link,
                ticket,
                status,
            } => self.on_descriptor_written(link, ticket, status),
            TransportEvent::CharacteristicRead {
                link,
                handle,
                status,
                value,
            } => self.on_characteristic_read(link, handle, status, value),
            TransportEvent::Notification {
                link,
                handle,
                value,
            } => self.on_notification(link, handle, value),
        }
        self.pump_dispatcher();
    }

    /// 重试定时器到期
    pub fn retry_write(&mut self, kind: QueueKind, link: LinkId, ticket: WriteTicket) {
        if !self.connection.is_current(link) {
            debug!("Ignoring {} write retry for stale {}", kind, link);
            return;
        }
        match kind {
            QueueKind::Descriptor => {
                let step = self
                    .writes
                    .retry_descriptor(ticket, &mut self.transport, link);
                self.handle_step(link, step);
            }
            QueueKind::Characteristic => {
                let step = self
                    .writes
                    .retry_characteristic(ticket, &mut self.transport, link);
                self.handle_step(link, step);
            }
        }
        self.pump_dispatcher();
    }

    fn on_services_discovered(
        &mut self,
        link: LinkId,
        status: &GattStatus,
        services: &[DiscoveredService],
    ) {
        match self.connection.on_services_discovered(
            link,
            status,
            services,
            &mut self.transport,
            &mut self.writes,
        ) {
            Discovery::Stale => {}
            Discovery::Failed(reason) => self.emit(SessionEvent::DiscoveryFailed { reason }),
            Discovery::Resolved {
                complete,
                notifications,
            } => {
                self.handle_step(link, notifications);
                let roles = self.connection.roles().roles();
                self.emit(SessionEvent::DiscoveryComplete { complete, roles });
                if self.auto_query {
                    self.queue_device_info();
                }
            }
        }
    }

    fn on_characteristic_written(&mut self, link: LinkId, ticket: WriteTicket, status: GattStatus) {
        if !self.connection.is_current(link) {
            debug!("Ignoring characteristic write result from stale {}", link);
            return;
        }
        let Completion::Done { request, step } =
            self.writes
                .on_characteristic_written(ticket, &mut self.transport, link)
        else {
            return;
        };

        let is_command = self.command_ticket == Some(ticket);
        if is_command {
            self.command_ticket = None;
        }
        match status {
            GattStatus::Success => {
                trace!("Characteristic write {} complete", ticket);
                self.emit(SessionEvent::WriteCompleted {
                    kind: QueueKind::Characteristic,
                });
            }
            GattStatus::Failure(reason) => {
                warn!(
                    "Characteristic write {} [{}] failed: {}",
                    ticket,
                    hex(&request.value),
                    reason
                );
                if is_command {
                    self.dispatcher.on_command_failed();
                }
                self.emit(SessionEvent::WriteFailed {
                    kind: QueueKind::Characteristic,
                    reason,
                });
            }
        }
        self.handle_step(link, step);
    }

    fn on_descriptor_written(&mut self, link: LinkId, ticket: WriteTicket, status: GattStatus) {
        if !self.connection.is_current(link) {
            debug!("Ignoring descriptor write result from stale {}", link);
            return;
        }
        let Completion::Done { request, step } =
            self.writes
                .on_descriptor_written(ticket, &mut self.transport, link)
        else {
            return;
        };

        match status {
            GattStatus::Success => {
                debug!(
                    "Descriptor {} of {} written",
                    request.handle.descriptor, request.handle.characteristic.characteristic
                );
                self.emit(SessionEvent::WriteCompleted {
                    kind: QueueKind::Descriptor,
                });
            }
            GattStatus::Failure(reason) => {
                warn!(
                    "Descriptor write to {} failed: {}",
                    request.handle.characteristic.characteristic, reason
                );
                self.emit(SessionEvent::WriteFailed {
                    kind: QueueKind::Descriptor,
                    reason,
                });
            }
        }
        self.handle_step(link, step);
    }

    fn on_characteristic_read(
        &mut self,
        link: LinkId,
        handle: CharHandle,
        status: GattStatus,
        value: Vec<u8>,
    ) {
        if !self.connection.is_current(link) {
            debug!("Ignoring read result from stale {}", link);
            return;
        }
        if !self.dispatcher.on_read_complete(&handle) {
            debug!("Unsolicited read result for {}", handle.characteristic);
        }

        match status {
            GattStatus::Success => {
                let text = self.values.insert(handle.characteristic, &value);
                debug!("Read {}: {:?}", handle.characteristic, text);
                self.info.apply_value(handle.characteristic, text);
                let role = self.connection.roles().role_of(&handle);
                self.emit(SessionEvent::DataAvailable {
                    characteristic: handle.characteristic,
                    role,
                    value,
                });
            }
            GattStatus::Failure(reason) => {
                warn!("Failed to read {}: {}", handle.characteristic, reason);
            }
        }
    }

    fn on_notification(&mut self, link: LinkId, handle: CharHandle, value: Vec<u8>) {
        if !self.connection.is_current(link) {
            debug!("Ignoring notification from stale {}", link);
            return;
        }

        let role = self.connection.roles().role_of(&handle);
        trace!("Notification from {:?}: [{}]", role, hex(&value));

        let response = if matches!(role, Some(Role::TxCharacteristic | Role::MldpData)) {
            self.correlator.feed(&value)
        } else {
            None
        };
        self.emit(SessionEvent::DataAvailable {
            characteristic: handle.characteristic,
            role,
            value,
        });

        if let Some(response) = response {
            self.dispatcher.on_response_complete();
            self.info.apply_response(&response);
            self.emit(SessionEvent::ResponseReady(response));
        }
    }

    /// 设备信息服务的全部特征入读取队列，然后是名称和状态查询
    fn queue_device_info(&mut self) {
        // 什么都没排上时也要报告 QueueIdle
        self.dispatch_active = true;

        let reads: Vec<_> = self
            .connection
            .roles()
            .information_characteristics()
            .iter()
            .map(|c| c.handle)
            .collect();
        for handle in reads {
            self.dispatcher.queue_read(handle);
        }

        if self.connection.roles().command_target().is_ok() {
            self.dispatcher.push(protocol::get_name());
            self.dispatcher.push(protocol::get_status());
        } else {
            debug!("No data channel, skipping name and status queries");
        }
    }

    /// 尽可能推进调度器
    fn pump_dispatcher(&mut self) {
        loop {
            let Ok(link) = self.connection.connected_link() else {
                return;
            };

            match self.dispatcher.dispatch_next(self.correlator.is_busy()) {
                Dispatch::Idle => {
                    if self.dispatch_active
                        && self.dispatcher.is_idle()
                        && !self.correlator.is_busy()
                    {
                        self.dispatch_active = false;
                        self.emit(SessionEvent::QueueIdle);
                    }
                    return;
                }
                Dispatch::Busy => return,
                Dispatch::Command(command) => {
                    self.dispatch_active = true;
                    let target = match self.connection.roles().command_target() {
                        Ok(t) => (t.handle, t.write_mode),
                        Err(e) => {
                            warn!("Dropping command [{}]: {}", hex(&command), e);
                            self.dispatcher.on_command_failed();
                            self.emit(SessionEvent::WriteFailed {
                                kind: QueueKind::Characteristic,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    };

                    debug!("Dispatching command [{}]", hex(&command));
                    let step = self.writes.enqueue_characteristic_write(
                        &mut self.transport,
                        link,
                        target.0,
                        command,
                        target.1,
                    );
                    self.command_ticket = self.writes.characteristics().last_ticket();
                    self.handle_step(link, step);
                    return;
                }
                Dispatch::Read(handle) => {
                    self.dispatch_active = true;
                    match self.transport.read_characteristic(link, &handle) {
                        Ok(()) => return,
                        Err(e) => {
                            warn!("Failed to read {}: {}", handle.characteristic, e);
                            self.dispatcher.on_read_complete(&handle);
                        }
                    }
                }
            }
        }
    }

    fn handle_step<W: WriteRequest>(&mut self, link: LinkId, step: Step<W>) {
        if let Some(ticket) = step.retry {
            self.outbox.push(Output::RetryWrite {
                kind: W::KIND,
                link,
                ticket,
            });
        }
        for (ticket, request, e) in step.dropped {
            warn!("Dropped {} write {}: {:?}", W::KIND, ticket, request);
            if W::KIND == QueueKind::Characteristic && self.command_ticket == Some(ticket) {
                self.command_ticket = None;
                self.dispatcher.on_command_failed();
            }
            self.emit(SessionEvent::WriteFailed {
                kind: W::KIND,
                reason: PfxError::WriteRejected(e).to_string(),
            });
        }
    }

    /// 链路变化时清空所有在途状态
    fn reset_link_state(&mut self) {
        self.writes.reset();
        self.correlator.reset();
        self.dispatcher.clear();
        self.command_ticket = None;
        self.dispatch_active = false;
    }

    fn emit(&mut self, event: SessionEvent) {
        self.outbox.push(Output::Event(event));
    }
}
