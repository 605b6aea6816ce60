//! 测试用传输层和服务发现数据

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use pfxlink_core::ble::{
    CCCD_UUID, CharHandle, CharProperties, DEVICE_INFORMATION_SERVICE_UUID, DescriptorHandle,
    DiscoveredCharacteristic, DiscoveredService, MANUFACTURER_NAME_UUID, MLDP_DATA_CHAR_UUID,
    MLDP_SERVICE_UUID, SERIAL_NUMBER_UUID, TRANSPARENT_RX_CHAR_UUID, TRANSPARENT_SERVICE_UUID,
    TRANSPARENT_TX_CHAR_UUID,
};
use pfxlink_core::pfx::protocol;
use pfxlink_core::{
    GattStatus, LinkId, Transport, TransportError, TransportEvent, WriteMode, WriteTicket,
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ADDRESS: &str = "00:1E:C0:12:34:56";

/// 传输层收到的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(LinkId, String),
    Disconnect(LinkId),
    Discover(LinkId),
    WriteCharacteristic {
        link: LinkId,
        ticket: WriteTicket,
        handle: CharHandle,
        value: Vec<u8>,
        mode: WriteMode,
    },
    WriteDescriptor {
        link: LinkId,
        ticket: WriteTicket,
        handle: DescriptorHandle,
        value: Vec<u8>,
    },
    Read(LinkId, CharHandle),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<Call>,
    pub unavailable: bool,
    /// 接下来拒绝的特征写次数
    pub reject_writes: usize,
    pub reject_reads: bool,
}

/// 记录调用的传输层
///
/// 设置了 `loopback` 时模拟一个设备：连接、发现、写入都立即成功，
/// 名称和状态查询会得到分片的通知响应。
#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
    loopback: Option<(mpsc::UnboundedSender<TransportEvent>, Vec<DiscoveredService>)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loopback(
        events: mpsc::UnboundedSender<TransportEvent>,
        services: Vec<DiscoveredService>,
    ) -> Self {
        Self {
            state: Arc::default(),
            loopback: Some((events, services)),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn set_unavailable(&self) {
        self.state.lock().unwrap().unavailable = true;
    }

    pub fn reject_writes(&self, count: usize) {
        self.state.lock().unwrap().reject_writes = count;
    }

    pub fn reject_reads(&self) {
        self.state.lock().unwrap().reject_reads = true;
    }

    /// 按顺序提交的特征写
    pub fn characteristic_writes(&self) -> Vec<(WriteTicket, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::WriteCharacteristic { ticket, value, .. } => Some((ticket, value)),
                _ => None,
            })
            .collect()
    }

    pub fn descriptor_writes(&self) -> Vec<(WriteTicket, DescriptorHandle, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::WriteDescriptor {
                    ticket,
                    handle,
                    value,
                    ..
                } => Some((ticket, handle, value)),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> Vec<CharHandle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Read(_, handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn echo(&self, event: TransportEvent) {
        if let Some((events, _)) = &self.loopback {
            let _ = events.send(event);
        }
    }
}

impl Transport for MockTransport {
    fn is_available(&self) -> bool {
        !self.state.lock().unwrap().unavailable
    }

    fn connect(&mut self, link: LinkId, address: &str) -> Result<(), TransportError> {
        self.record(Call::Connect(link, address.to_string()));
        self.echo(TransportEvent::Connected { link });
        Ok(())
    }

    fn disconnect(&mut self, link: LinkId) {
        self.record(Call::Disconnect(link));
        self.echo(TransportEvent::Disconnected { link });
    }

    fn discover_services(&mut self, link: LinkId) -> Result<(), TransportError> {
        self.record(Call::Discover(link));
        if let Some((events, services)) = &self.loopback {
            let _ = events.send(TransportEvent::ServicesDiscovered {
                link,
                status: GattStatus::Success,
                services: services.clone(),
            });
        }
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
        {
            let mut state = self.state.lock().unwrap();
            if state.reject_writes > 0 {
                state.reject_writes -= 1;
                return Err(TransportError::Busy);
            }
        }
        self.record(Call::WriteCharacteristic {
            link,
            ticket,
            handle: *handle,
            value: value.to_vec(),
            mode,
        });

        self.echo(TransportEvent::CharacteristicWritten {
            link,
            ticket,
            status: GattStatus::Success,
        });
        let tx = tx_handle();
        let response = if value == protocol::get_name().as_slice() {
            Some(name_response("Brick"))
        } else if value == protocol::get_status().as_slice() {
            Some(status_response())
        } else {
            None
        };
        if let Some(response) = response {
            for fragment in response.chunks(20) {
                self.echo(TransportEvent::Notification {
                    link,
                    handle: tx,
                    value: fragment.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        link: LinkId,
        ticket: WriteTicket,
        handle: &DescriptorHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(Call::WriteDescriptor {
            link,
            ticket,
            handle: *handle,
            value: value.to_vec(),
        });
        self.echo(TransportEvent::DescriptorWritten {
            link,
            ticket,
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        link: LinkId,
        handle: &CharHandle,
    ) -> Result<(), TransportError> {
        if self.state.lock().unwrap().reject_reads {
            return Err(TransportError::Busy);
        }
        self.record(Call::Read(link, *handle));
        let value = match handle.characteristic {
            u if u == MANUFACTURER_NAME_UUID => b"Fx Bricks".to_vec(),
            u if u == SERIAL_NUMBER_UUID => b"PFX-0042".to_vec(),
            _ => Vec::new(),
        };
        self.echo(TransportEvent::CharacteristicRead {
            link,
            handle: *handle,
            status: GattStatus::Success,
            value,
        });
        Ok(())
    }
}

fn characteristic(
    service: Uuid,
    uuid: Uuid,
    properties: CharProperties,
    cccd: bool,
) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic {
        handle: CharHandle::new(service, uuid),
        properties,
        descriptors: if cccd { vec![CCCD_UUID] } else { Vec::new() },
    }
}

pub fn tx_handle() -> CharHandle {
    CharHandle::new(TRANSPARENT_SERVICE_UUID, TRANSPARENT_TX_CHAR_UUID)
}

pub fn rx_handle() -> CharHandle {
    CharHandle::new(TRANSPARENT_SERVICE_UUID, TRANSPARENT_RX_CHAR_UUID)
}

pub fn mldp_handle() -> CharHandle {
    CharHandle::new(MLDP_SERVICE_UUID, MLDP_DATA_CHAR_UUID)
}

pub fn information_service() -> DiscoveredService {
    let readable = CharProperties {
        read: true,
        ..Default::default()
    };
    DiscoveredService {
        uuid: DEVICE_INFORMATION_SERVICE_UUID,
        characteristics: vec![
            characteristic(
                DEVICE_INFORMATION_SERVICE_UUID,
                MANUFACTURER_NAME_UUID,
                readable,
                false,
            ),
            characteristic(
                DEVICE_INFORMATION_SERVICE_UUID,
                SERIAL_NUMBER_UUID,
                readable,
                false,
            ),
        ],
    }
}

pub fn transparent_service() -> DiscoveredService {
    DiscoveredService {
        uuid: TRANSPARENT_SERVICE_UUID,
        characteristics: vec![
            characteristic(
                TRANSPARENT_SERVICE_UUID,
                TRANSPARENT_TX_CHAR_UUID,
                CharProperties {
                    notify: true,
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
                true,
            ),
            characteristic(
                TRANSPARENT_SERVICE_UUID,
                TRANSPARENT_RX_CHAR_UUID,
                CharProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
                false,
            ),
        ],
    }
}

pub fn mldp_service() -> DiscoveredService {
    DiscoveredService {
        uuid: MLDP_SERVICE_UUID,
        characteristics: vec![characteristic(
            MLDP_SERVICE_UUID,
            MLDP_DATA_CHAR_UUID,
            CharProperties {
                notify: true,
                write: true,
                ..Default::default()
            },
            true,
        )],
    }
}

/// 名称响应：`87 <name> 00 <填充>`，总长 30 字节
pub fn name_response(name: &str) -> Vec<u8> {
    let mut data = vec![0x87];
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    data.resize(30, 0xaa);
    data
}

/// 状态响应：硬件版本 `1234`，固件版本 `2.05`
pub fn status_response() -> Vec<u8> {
    let mut data = vec![0u8; 44];
    data[0] = 0x81;
    data[7] = 0x12;
    data[8] = 0x34;
    data[37] = 0x02;
    data[38] = 0x05;
    data
}
