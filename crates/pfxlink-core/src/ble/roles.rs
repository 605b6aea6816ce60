//! GATT 角色解析
//!
//! 把服务发现得到的服务/特征树映射成 [`RoleTable`]。
//!
//! # 识别规则
//!
//! - Device Information 服务: `0000180a-...`，记录其下全部可读特征
//! - MLDP 私有服务: 数据特征 `...000301` → [`Role::MldpData`]
//! - Transparent 私有服务: Tx → [`Role::TxCharacteristic`]，Rx → [`Role::RxCharacteristic`]
//!
//! 两个私有服务同时存在时按枚举顺序处理，后出现的服务覆盖同一角色，
//! 并成为 [`Role::DataService`]。

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use uuid::Uuid;

use crate::ble::transport::WriteMode;
use crate::ble::{
    CCCD_UUID, CharHandle, CharProperties, DEVICE_INFORMATION_SERVICE_UUID,
    DiscoveredCharacteristic, DiscoveredService, MLDP_DATA_CHAR_UUID, MLDP_SERVICE_UUID,
    TRANSPARENT_RX_CHAR_UUID, TRANSPARENT_SERVICE_UUID, TRANSPARENT_TX_CHAR_UUID,
};
use crate::error::PfxError;

/// 语义角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    InformationService,
    DataService,
    TxCharacteristic,
    RxCharacteristic,
    MldpData,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::InformationService => "device-information",
            Role::DataService => "data-service",
            Role::TxCharacteristic => "tx",
            Role::RxCharacteristic => "rx",
            Role::MldpData => "mldp-data",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "device-information" | "info" => Ok(Role::InformationService),
            "data-service" | "data" => Ok(Role::DataService),
            "tx" => Ok(Role::TxCharacteristic),
            "rx" => Ok(Role::RxCharacteristic),
            "mldp-data" | "mldp" => Ok(Role::MldpData),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// 私有数据服务的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataServiceKind {
    Mldp,
    Transparent,
}

impl DataServiceKind {
    pub fn uuid(&self) -> Uuid {
        match self {
            DataServiceKind::Mldp => MLDP_SERVICE_UUID,
            DataServiceKind::Transparent => TRANSPARENT_SERVICE_UUID,
        }
    }

    fn from_uuid(uuid: Uuid) -> Option<Self> {
        if uuid == MLDP_SERVICE_UUID {
            Some(DataServiceKind::Mldp)
        } else if uuid == TRANSPARENT_SERVICE_UUID {
            Some(DataServiceKind::Transparent)
        } else {
            None
        }
    }
}

/// 已解析的特征
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    pub handle: CharHandle,
    pub properties: CharProperties,
    /// 是否带有 CCCD，可以通过描述符写开启通知
    pub has_cccd: bool,
    /// 解析时固定下来的写模式：支持无应答写则一律使用无应答写
    pub write_mode: WriteMode,
}

impl ResolvedCharacteristic {
    fn from_discovered(c: &DiscoveredCharacteristic) -> Self {
        let write_mode = if c.properties.write_without_response {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        };
        Self {
            handle: c.handle,
            properties: c.properties,
            has_cccd: c.has_descriptor(CCCD_UUID),
            write_mode,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.handle.characteristic
    }
}

/// 角色表
///
/// 每个角色显式地"存在/不存在"，调用方通过 [`RoleTable::has`] 或
/// [`RoleTable::characteristic`] 查询，不存在的角色返回 `RoleUnavailable`。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleTable {
    information_service: Option<Uuid>,
    data_service: Option<DataServiceKind>,
    characteristics: BTreeMap<Role, ResolvedCharacteristic>,
    information_characteristics: Vec<ResolvedCharacteristic>,
}

impl RoleTable {
    pub fn is_empty(&self) -> bool {
        self.information_service.is_none()
            && self.data_service.is_none()
            && self.characteristics.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn has(&self, role: Role) -> bool {
        match role {
            Role::InformationService => self.information_service.is_some(),
            Role::DataService => self.data_service.is_some(),
            _ => self.characteristics.contains_key(&role),
        }
    }

    /// 已解析的角色列表
    pub fn roles(&self) -> Vec<Role> {
        [
            Role::InformationService,
            Role::DataService,
            Role::TxCharacteristic,
            Role::RxCharacteristic,
            Role::MldpData,
        ]
        .into_iter()
        .filter(|r| self.has(*r))
        .collect()
    }

    pub fn data_service(&self) -> Option<DataServiceKind> {
        self.data_service
    }

    pub fn characteristic(&self, role: Role) -> Result<&ResolvedCharacteristic, PfxError> {
        self.characteristics
            .get(&role)
            .ok_or(PfxError::RoleUnavailable(role))
    }

    /// 应用命令的写入目标
    ///
    /// 数据服务是 MLDP 时写入 MLDP 数据特征，否则写入 Rx 特征；
    /// 首选目标缺失时退回另一个。
    pub fn command_target(&self) -> Result<&ResolvedCharacteristic, PfxError> {
        let (first, second) = match self.data_service {
            Some(DataServiceKind::Mldp) => (Role::MldpData, Role::RxCharacteristic),
            Some(DataServiceKind::Transparent) => (Role::RxCharacteristic, Role::MldpData),
            None => return Err(PfxError::RoleUnavailable(Role::DataService)),
        };
        self.characteristics
            .get(&first)
            .or_else(|| self.characteristics.get(&second))
            .ok_or(PfxError::RoleUnavailable(first))
    }

    /// 需要开启通知的数据特征（Tx 和 MLDP 数据）
    pub fn notify_characteristics(&self) -> impl Iterator<Item = &ResolvedCharacteristic> {
        [Role::TxCharacteristic, Role::MldpData]
            .into_iter()
            .filter_map(|r| self.characteristics.get(&r))
            .filter(|c| c.properties.notify)
    }

    /// Device Information 服务下可读的特征，按枚举顺序
    pub fn information_characteristics(&self) -> &[ResolvedCharacteristic] {
        &self.information_characteristics
    }

    /// 句柄对应的角色
    pub fn role_of(&self, handle: &CharHandle) -> Option<Role> {
        self.characteristics
            .iter()
            .find(|(_, c)| c.handle == *handle)
            .map(|(role, _)| *role)
    }

    /// 数据通道是否可用：MLDP 数据特征，或 Tx/Rx 两者都在
    pub fn is_complete(&self) -> bool {
        self.has(Role::MldpData) || (self.has(Role::TxCharacteristic) && self.has(Role::RxCharacteristic))
    }
}

/// 解析服务发现结果
///
/// 角色表不完整不算失败，调用方在使用缺失的角色时才会得到 `RoleUnavailable`。
pub fn resolve_roles(services: &[DiscoveredService]) -> RoleTable {
    let mut table = RoleTable::default();

    for service in services {
        if service.uuid == DEVICE_INFORMATION_SERVICE_UUID {
            table.information_service = Some(service.uuid);
            table.information_characteristics = service
                .characteristics
                .iter()
                .filter(|c| c.properties.read)
                .map(ResolvedCharacteristic::from_discovered)
                .collect();
            debug!(
                "Found Device Information service with {} readable characteristic(s)",
                table.information_characteristics.len()
            );
            continue;
        }

        let Some(kind) = DataServiceKind::from_uuid(service.uuid) else {
            continue;
        };
        table.data_service = Some(kind);

        for c in &service.characteristics {
            let role = match c.uuid() {
                u if u == TRANSPARENT_TX_CHAR_UUID => Role::TxCharacteristic,
                u if u == TRANSPARENT_RX_CHAR_UUID => Role::RxCharacteristic,
                u if u == MLDP_DATA_CHAR_UUID => Role::MldpData,
                _ => continue,
            };
            debug!("Resolved {} characteristic in {:?} service", role, kind);
            table
                .characteristics
                .insert(role, ResolvedCharacteristic::from_discovered(c));
        }
    }

    if !table.is_complete() {
        debug!("Did not find a usable MLDP or Transparent data channel");
    }

    table
}
