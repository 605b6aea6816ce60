//! 会话任务
//!
//! 所有状态都在一个 tokio 任务里串行修改。调用方通过 [`SessionHandle`]
//! 发送请求，传输层事件和重试定时器也都作为消息进入同一个任务，
//! 因此 [`LinkCore`] 不需要任何锁。
//!
//! 事件通过 broadcast 分发，链路状态通过 watch 发布。

pub mod link_core;
pub mod store;

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::ble::btleplug_transport::BtleplugTransport;
use crate::ble::connection::LinkState;
use crate::ble::roles::Role;
use crate::ble::transport::{LinkId, Transport, TransportEvent, WriteTicket};
use crate::ble::write_queue::QueueKind;
use crate::config::Settings;
use crate::error::PfxError;

pub use self::link_core::{LinkCore, Output, SessionEvent};
pub use self::store::{BrickInfo, GattValueStore};

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 被同步拒绝的写请求在多久后重试
    pub retry_delay: Duration,
    /// 服务发现后自动读取设备信息并查询名称和状态
    pub auto_query: bool,
    /// 事件广播的缓冲大小
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(200),
            auto_query: true,
            event_capacity: 64,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            retry_delay: settings.retry_delay(),
            auto_query: settings.auto_query,
            ..Default::default()
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Connect {
        address: String,
        reply: Reply<Result<LinkId, PfxError>>,
    },
    Disconnect {
        reply: Reply<bool>,
    },
    PushCommand {
        command: Vec<u8>,
        reply: Reply<Result<(), PfxError>>,
    },
    SendCommand {
        command: Vec<u8>,
        reply: Reply<Result<(), PfxError>>,
    },
    ReadCharacteristic {
        role: Role,
        reply: Reply<Result<(), PfxError>>,
    },
    QueryDeviceInfo {
        reply: Reply<Result<(), PfxError>>,
    },
    BrickInfo {
        reply: Reply<BrickInfo>,
    },
    GattValues {
        reply: Reply<HashMap<Uuid, String>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct RetryTimer {
    kind: QueueKind,
    link: LinkId,
    ticket: WriteTicket,
}

pub struct Session<T> {
    core: LinkCore<T>,
    config: SessionConfig,
    requests: mpsc::UnboundedReceiver<Request>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    retry_tx: mpsc::UnboundedSender<RetryTimer>,
    retry_rx: mpsc::UnboundedReceiver<RetryTimer>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<LinkState>,
}

impl<T: Transport + 'static> Session<T> {
    /// 启动会话任务
    ///
    /// `transport_events` 是传输层送回事件的通道接收端。
    pub fn spawn(
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
    ) -> SessionHandle {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let (state, state_rx) = watch::channel(LinkState::Disconnected);

        let session = Session {
            core: LinkCore::new(transport, config.auto_query),
            config,
            requests,
            transport_events,
            retry_tx,
            retry_rx,
            events: events.clone(),
            state,
        };
        tokio::spawn(session.run());

        SessionHandle {
            requests: request_tx,
            events,
            state: state_rx,
        }
    }

    async fn run(mut self) {
        debug!("Session started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.core.disconnect();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.core.disconnect();
                        break;
                    }
                },
                Some(event) = self.transport_events.recv() => self.core.handle_event(event),
                Some(timer) = self.retry_rx.recv() => {
                    self.core.retry_write(timer.kind, timer.link, timer.ticket);
                }
            }
            self.flush();
        }
        self.flush();
        debug!("Session stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { address, reply } => {
                let _ = reply.send(self.core.connect(&address));
            }
            Request::Disconnect { reply } => {
                let _ = reply.send(self.core.disconnect());
            }
            Request::PushCommand { command, reply } => {
                let _ = reply.send(self.core.push_command(command));
            }
            Request::SendCommand { command, reply } => {
                let _ = reply.send(self.core.send_command(command));
            }
            Request::ReadCharacteristic { role, reply } => {
                let _ = reply.send(self.core.read_characteristic(role));
            }
            Request::QueryDeviceInfo { reply } => {
                let _ = reply.send(self.core.query_device_info());
            }
            Request::BrickInfo { reply } => {
                let _ = reply.send(self.core.brick_info().clone());
            }
            Request::GattValues { reply } => {
                let _ = reply.send(self.core.gatt_values().to_map());
            }
            // 在 run 中处理
            Request::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// 发布事件、启动重试定时器、更新链路状态
    fn flush(&mut self) {
        for output in self.core.drain_outbox() {
            match output {
                Output::Event(event) => {
                    // 没有订阅者时发送失败，忽略即可
                    let _ = self.events.send(event);
                }
                Output::RetryWrite { kind, link, ticket } => {
                    let retry_tx = self.retry_tx.clone();
                    let delay = self.config.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = retry_tx.send(RetryTimer { kind, link, ticket });
                    });
                }
            }
        }

        let state = self.core.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                info!("Link state: {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }
}

impl Session<BtleplugTransport> {
    /// 在第一个蓝牙适配器上启动会话
    pub async fn spawn_btleplug(settings: &Settings) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = BtleplugTransport::new(tx, settings.scan_timeout()).await;
        if !transport.is_available() {
            warn!("Session started without a Bluetooth adapter");
        }
        Session::spawn(transport, rx, SessionConfig::from(settings))
    }
}

/// 会话句柄，可以随意克隆
///
/// 所有请求立即返回：`Ok` 只表示请求被接受，结果以 [`SessionEvent`] 送达。
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<LinkState>,
}

impl SessionHandle {
    async fn call<R>(&self, make: impl FnOnce(Reply<R>) -> Request) -> Result<R, PfxError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| PfxError::SessionClosed)?;
        rx.await.map_err(|_| PfxError::SessionClosed)
    }

    pub async fn connect(&self, address: &str) -> Result<LinkId, PfxError> {
        let address = address.to_string();
        self.call(|reply| Request::Connect { address, reply })
            .await?
    }

    /// 返回 `false` 表示没有活动链路
    pub async fn disconnect(&self) -> Result<bool, PfxError> {
        self.call(|reply| Request::Disconnect { reply }).await
    }

    /// 命令入调度队列，一次一个发送，等待响应后再发下一个
    pub async fn push_command(&self, command: Vec<u8>) -> Result<(), PfxError> {
        self.call(|reply| Request::PushCommand { command, reply })
            .await?
    }

    /// 不经调度器直接写入命令特征（遥控器事件这类没有响应的帧）
    pub async fn send_command(&self, command: Vec<u8>) -> Result<(), PfxError> {
        self.call(|reply| Request::SendCommand { command, reply })
            .await?
    }

    pub async fn read_characteristic(&self, role: Role) -> Result<(), PfxError> {
        self.call(|reply| Request::ReadCharacteristic { role, reply })
            .await?
    }

    pub async fn query_device_info(&self) -> Result<(), PfxError> {
        self.call(|reply| Request::QueryDeviceInfo { reply }).await?
    }

    pub async fn brick_info(&self) -> Result<BrickInfo, PfxError> {
        self.call(|reply| Request::BrickInfo { reply }).await
    }

    pub async fn gatt_values(&self) -> Result<HashMap<Uuid, String>, PfxError> {
        self.call(|reply| Request::GattValues { reply }).await
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// 等待链路进入某个状态
    pub async fn wait_for_state(&self, target: LinkState) -> Result<(), PfxError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map_err(|_| PfxError::SessionClosed)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// 断开链路并停止会话任务
    pub async fn shutdown(&self) -> Result<(), PfxError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }
}
