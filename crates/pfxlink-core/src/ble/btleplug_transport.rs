//! 基于 btleplug 的传输层
//!
//! btleplug 的接口是 async 的，而 [`Transport`] 要求立即返回。
//! 这里的做法是每个请求 spawn 一个 tokio 任务，完成后把结果作为
//! [`TransportEvent`] 发回会话。
//!
//! 每个链路有一个常驻任务：查找并连接外设，然后转发通知和断开事件，
//! 直到链路结束。
//!
//! 拆除旧链路（停止任务、断开外设）也在后台进行。拆除任务按顺序串起来，
//! 新链路的任务先等最近一次拆除结束再去查找外设，否则旧外设迟到的
//! `DeviceDisconnected` 会被当成新链路断开。

use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::ble::transport::{
    GattStatus, LinkId, Transport, TransportError, TransportEvent, WriteMode, WriteTicket,
};
use crate::ble::{
    CCCD_UUID, CharHandle, CharProperties, DISABLE_NOTIFICATION_VALUE, DescriptorHandle,
    DiscoveredCharacteristic, DiscoveredService, ENABLE_NOTIFICATION_VALUE,
};

/// 扫描期间检查外设列表的间隔
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// 可以被多方等待的拆除任务
type Teardown = Shared<BoxFuture<'static, ()>>;

struct ActiveLink {
    link: LinkId,
    address: String,
    adapter: Adapter,
    /// 连接成功后由链路任务填入
    peripheral: watch::Receiver<Option<PlatformPeripheral>>,
    task: JoinHandle<()>,
}

pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    events: EventSender,
    scan_timeout: Duration,
    active: Option<ActiveLink>,
    /// 最近一次拆除
    teardown: Option<Teardown>,
}

impl BtleplugTransport {
    /// 取第一个蓝牙适配器；没有适配器时传输层仍然创建，但不可用
    pub async fn new(events: EventSender, scan_timeout: Duration) -> Self {
        let adapter = match first_adapter().await {
            Ok(Some(adapter)) => Some(adapter),
            Ok(None) => {
                warn!("No Bluetooth adapters found");
                None
            }
            Err(e) => {
                warn!("Failed to initialize Bluetooth manager: {}", e);
                None
            }
        };

        Self {
            adapter,
            events,
            scan_timeout,
            active: None,
            teardown: None,
        }
    }

    /// 停止链路任务并在后台断开它的外设，`notify` 时完成后报告 `Disconnected`
    fn retire(&mut self, active: ActiveLink, notify: bool) {
        let ActiveLink {
            link,
            address,
            adapter,
            peripheral,
            task,
        } = active;
        task.abort();

        let events = self.events.clone();
        let teardown = chain_teardown(self.teardown.take(), async move {
            // 等任务真正停下，它可能刚连上还没填入外设
            let _ = task.await;
            let connected = peripheral.borrow().clone();
            release_peripheral(&adapter, &address, connected).await;
            if notify {
                let _ = events.send(TransportEvent::Disconnected { link });
            }
        });
        self.teardown = Some(teardown);
    }

    /// 当前链路上已连接的外设
    fn peripheral(&self, link: LinkId) -> Result<PlatformPeripheral, TransportError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.link == link)
            .ok_or(TransportError::NotConnected)?;
        active
            .peripheral
            .borrow()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(
        &self,
        link: LinkId,
        handle: &CharHandle,
    ) -> Result<(PlatformPeripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(link)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == handle.service && c.uuid == handle.characteristic)
            .ok_or_else(|| TransportError::UnknownAttribute(handle.characteristic.to_string()))?;
        Ok((peripheral, characteristic))
    }
}

impl Transport for BtleplugTransport {
    fn is_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn connect(&mut self, link: LinkId, address: &str) -> Result<(), TransportError> {
        let adapter = self.adapter.clone().ok_or(TransportError::Unavailable)?;

        if let Some(old) = self.active.take() {
            debug!("Dropping {} for new connection", old.link);
            self.retire(old, false);
        }

        let (slot, peripheral) = watch::channel(None);
        let task = tokio::spawn(run_link(
            adapter.clone(),
            link,
            address.to_string(),
            self.scan_timeout,
            self.teardown.clone(),
            slot,
            self.events.clone(),
        ));

        self.active = Some(ActiveLink {
            link,
            address: address.to_string(),
            adapter,
            peripheral,
            task,
        });
        Ok(())
    }

    fn disconnect(&mut self, link: LinkId) {
        let Some(active) = self.active.take_if(|a| a.link == link) else {
            debug!("Disconnect for inactive {}", link);
            return;
        };
        self.retire(active, true);
    }

    fn discover_services(&mut self, link: LinkId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(link)?;
        let events = self.events.clone();

        tokio::spawn(async move {
            let (status, services) = match peripheral.discover_services().await {
                Ok(()) => (GattStatus::Success, map_services(&peripheral)),
                Err(e) => (GattStatus::Failure(e.to_string()), Vec::new()),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered {
                link,
                status,
                services,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        link: LinkId,
        ticket: WriteTicket,
        handle: &CharHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(link, handle)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let value = value.to_vec();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = peripheral
                .write(&characteristic, &value, write_type)
                .await
                .into();
            let _ = events.send(TransportEvent::CharacteristicWritten {
                link,
                ticket,
                status,
            });
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        link: LinkId,
        ticket: WriteTicket,
        handle: &DescriptorHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(link, &handle.characteristic)?;
        let events = self.events.clone();

        // btleplug 自己管理 CCCD，开关通知要走 subscribe/unsubscribe
        let request = if handle.descriptor == CCCD_UUID {
            if value == ENABLE_NOTIFICATION_VALUE {
                DescriptorRequest::Subscribe
            } else if value == DISABLE_NOTIFICATION_VALUE {
                DescriptorRequest::Unsubscribe
            } else {
                return Err(TransportError::Rejected(format!(
                    "unsupported CCCD value {value:02X?}"
                )));
            }
        } else {
            let descriptor = characteristic
                .descriptors
                .iter()
                .find(|d| d.uuid == handle.descriptor)
                .cloned()
                .ok_or_else(|| TransportError::UnknownAttribute(handle.descriptor.to_string()))?;
            DescriptorRequest::Write(descriptor, value.to_vec())
        };

        tokio::spawn(async move {
            let result = match request {
                DescriptorRequest::Subscribe => peripheral.subscribe(&characteristic).await,
                DescriptorRequest::Unsubscribe => peripheral.unsubscribe(&characteristic).await,
                DescriptorRequest::Write(descriptor, value) => {
                    peripheral.write_descriptor(&descriptor, &value).await
                }
            };
            let _ = events.send(TransportEvent::DescriptorWritten {
                link,
                ticket,
                status: result.into(),
            });
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        link: LinkId,
        handle: &CharHandle,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(link, handle)?;
        let handle = *handle;
        let events = self.events.clone();

        tokio::spawn(async move {
            let (status, value) = match peripheral.read(&characteristic).await {
                Ok(value) => (GattStatus::Success, value),
                Err(e) => (GattStatus::Failure(e.to_string()), Vec::new()),
            };
            let _ = events.send(TransportEvent::CharacteristicRead {
                link,
                handle,
                status,
                value,
            });
        });
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

enum DescriptorRequest {
    Subscribe,
    Unsubscribe,
    Write(btleplug::api::Descriptor, Vec<u8>),
}

/// 在前一次拆除结束后执行 `work`
fn chain_teardown(
    previous: Option<Teardown>,
    work: impl Future<Output = ()> + Send + 'static,
) -> Teardown {
    let task = tokio::spawn(async move {
        if let Some(previous) = previous {
            previous.await;
        }
        work.await;
    });
    async move {
        let _ = task.await;
    }
    .boxed()
    .shared()
}

/// 断开链路留下的外设；链路任务没来得及填入时按地址查找
async fn release_peripheral(
    adapter: &Adapter,
    address: &str,
    peripheral: Option<PlatformPeripheral>,
) {
    let peripheral = match peripheral {
        Some(p) => Some(p),
        None => match_peripheral(adapter, address).await.ok().flatten(),
    };
    let Some(p) = peripheral else {
        return;
    };
    if matches!(p.is_connected().await, Ok(false)) {
        return;
    }

    info!("Disconnecting {}", address);
    if let Err(e) = p.disconnect().await {
        warn!("Failed to disconnect peripheral: {}", e);
    }
}

async fn first_adapter() -> Result<Option<Adapter>, btleplug::Error> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    Ok(adapters.into_iter().next())
}

/// 链路任务：连接并转发通知，结束时总是报告 `Disconnected`
async fn run_link(
    adapter: Adapter,
    link: LinkId,
    address: String,
    scan_timeout: Duration,
    teardown: Option<Teardown>,
    slot: watch::Sender<Option<PlatformPeripheral>>,
    events: EventSender,
) {
    if let Some(teardown) = teardown {
        debug!("Waiting for previous link teardown before {}", link);
        teardown.await;
    }
    if let Err(e) = serve_link(&adapter, link, &address, scan_timeout, &slot, &events).await {
        warn!("Connection to {} failed: {}", address, e);
    }
    slot.send_replace(None);
    let _ = events.send(TransportEvent::Disconnected { link });
}

async fn serve_link(
    adapter: &Adapter,
    link: LinkId,
    address: &str,
    scan_timeout: Duration,
    slot: &watch::Sender<Option<PlatformPeripheral>>,
    events: &EventSender,
) -> Result<(), btleplug::Error> {
    let peripheral = find_peripheral(adapter, address, scan_timeout)
        .await?
        .ok_or(btleplug::Error::DeviceNotFound)?;

    let mut central_events = adapter.events().await?;
    info!("Connecting to {}", address);
    peripheral.connect().await?;
    let mut notifications = peripheral.notifications().await?;

    slot.send_replace(Some(peripheral.clone()));
    let _ = events.send(TransportEvent::Connected { link });

    let id = peripheral.id();
    loop {
        tokio::select! {
            notification = notifications.next() => {
                let Some(n) = notification else {
                    debug!("Notification stream closed for {}", link);
                    break;
                };
                let Some(c) = peripheral.characteristics().into_iter().find(|c| c.uuid == n.uuid) else {
                    debug!("Notification from unknown characteristic {}", n.uuid);
                    continue;
                };
                let _ = events.send(TransportEvent::Notification {
                    link,
                    handle: CharHandle::new(c.service_uuid, c.uuid),
                    value: n.value,
                });
            }
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(pid)) if pid == id => {
                    info!("Peripheral {} disconnected", address);
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    }
    Ok(())
}

/// 按地址查找外设，必要时短暂扫描
async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    timeout: Duration,
) -> Result<Option<PlatformPeripheral>, btleplug::Error> {
    if let Some(p) = match_peripheral(adapter, address).await? {
        return Ok(Some(p));
    }

    info!("Scanning for {} ({}s)", address, timeout.as_secs());
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = Instant::now() + timeout;
    let mut found = None;
    while Instant::now() < deadline {
        time::sleep(SCAN_POLL_INTERVAL).await;
        if let Some(p) = match_peripheral(adapter, address).await? {
            found = Some(p);
            break;
        }
    }
    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {}", e);
    }

    Ok(found)
}

async fn match_peripheral(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<PlatformPeripheral>, btleplug::Error> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals.into_iter().find(|p| {
        p.address().to_string().eq_ignore_ascii_case(address)
            || p.id().to_string().eq_ignore_ascii_case(address)
    }))
}

fn map_services(peripheral: &PlatformPeripheral) -> Vec<DiscoveredService> {
    peripheral
        .services()
        .into_iter()
        .map(|s| DiscoveredService {
            uuid: s.uuid,
            characteristics: s
                .characteristics
                .into_iter()
                .map(|c| DiscoveredCharacteristic {
                    handle: CharHandle::new(c.service_uuid, c.uuid),
                    properties: map_properties(c.properties),
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

fn map_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}
