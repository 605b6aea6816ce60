//! BLE 链路层
//!
//! - **transport**: 传输层抽象（回调式的连接/发现/读写/通知）
//! - **roles**: 把发现到的服务和特征映射成语义角色
//! - **write_queue**: 单在途写队列（描述符写、特征写各一个）
//! - **connection**: 连接状态机
//! - **btleplug_transport**: 基于 btleplug 的真实传输层

pub mod btleplug_transport;
pub mod connection;
pub mod roles;
pub mod transport;
pub mod write_queue;

use uuid::Uuid;

pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Microchip MLDP 私有服务（私有数据服务 A）
pub const MLDP_SERVICE_UUID: Uuid = Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000300);
/// MLDP 数据特征，属性: notify, write
pub const MLDP_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000301);

/// Microchip Transparent 私有服务（私有数据服务 B）
pub const TRANSPARENT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);
/// 设备 → 主机，属性: notify, write, write no response
pub const TRANSPARENT_TX_CHAR_UUID: Uuid =
    Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);
/// 主机 → 设备，属性: write, write no response
pub const TRANSPARENT_RX_CHAR_UUID: Uuid =
    Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

// Device Information 服务下用到的特征
pub const MODEL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const SERIAL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
pub const FIRMWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const HARDWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb);
pub const SOFTWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);
pub const MANUFACTURER_NAME_UUID: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// 特征句柄：传输层用它定位一个具体特征
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharHandle {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharHandle {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// 该特征下的某个描述符
    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorHandle {
        DescriptorHandle {
            characteristic: *self,
            descriptor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle {
    pub characteristic: CharHandle,
    pub descriptor: Uuid,
}

/// 特征属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// 服务发现得到的特征
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub handle: CharHandle,
    pub properties: CharProperties,
    /// 该特征下的描述符 UUID
    pub descriptors: Vec<Uuid>,
}

impl DiscoveredCharacteristic {
    pub fn uuid(&self) -> Uuid {
        self.handle.characteristic
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// 服务发现得到的服务，特征保持枚举顺序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}
