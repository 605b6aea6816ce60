//! 会话数据
//!
//! - [`GattValueStore`]: 最近一次读到的特征值，按 UUID 索引
//! - [`BrickInfo`]: 从设备信息服务和 PFx 响应汇总出的设备信息
//!
//! 两者都属于会话，每次发起连接时清空。

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::ble::{
    FIRMWARE_REVISION_UUID, HARDWARE_REVISION_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID,
    SERIAL_NUMBER_UUID, SOFTWARE_REVISION_UUID,
};
use crate::pfx::PfxResponse;

/// 最近读到的特征值（文本）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattValueStore {
    values: HashMap<Uuid, String>,
}

impl GattValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 UTF-8 解码后保存，非法字节替换，末尾的 NUL 去掉
    pub fn insert(&mut self, uuid: Uuid, value: &[u8]) -> &str {
        let text = String::from_utf8_lossy(value)
            .trim_end_matches('\0')
            .to_string();
        self.values.insert(uuid, text);
        self.values.get(&uuid).map_or("", String::as_str)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&str> {
        self.values.get(uuid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn to_map(&self) -> HashMap<Uuid, String> {
        self.values.clone()
    }
}

/// 设备信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickInfo {
    pub name: Option<String>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub manufacturer_name: Option<String>,
    pub firmware_revision: Option<String>,
    pub hardware_revision: Option<String>,
    pub software_revision: Option<String>,
}

impl BrickInfo {
    /// 记录一个设备信息服务特征的值；返回 `false` 表示不是已知特征
    pub fn apply_value(&mut self, uuid: Uuid, text: &str) -> bool {
        let slot = match uuid {
            u if u == MODEL_NUMBER_UUID => &mut self.model_number,
            u if u == SERIAL_NUMBER_UUID => &mut self.serial_number,
            u if u == MANUFACTURER_NAME_UUID => &mut self.manufacturer_name,
            u if u == FIRMWARE_REVISION_UUID => &mut self.firmware_revision,
            u if u == HARDWARE_REVISION_UUID => &mut self.hardware_revision,
            u if u == SOFTWARE_REVISION_UUID => &mut self.software_revision,
            _ => return false,
        };
        *slot = Some(text.to_string());
        true
    }

    pub fn apply_response(&mut self, response: &PfxResponse) {
        match response {
            PfxResponse::Status {
                hardware_version,
                firmware_version,
            } => {
                self.hardware_version = Some(hardware_version.clone());
                self.firmware_version = Some(firmware_version.clone());
            }
            PfxResponse::Name { name } => self.name = Some(name.clone()),
            PfxResponse::Other { .. } => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for BrickInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Name", &self.name),
            ("Hardware version", &self.hardware_version),
            ("Firmware version", &self.firmware_version),
            ("Model number", &self.model_number),
            ("Serial number", &self.serial_number),
            ("Manufacturer", &self.manufacturer_name),
            ("Firmware revision", &self.firmware_revision),
            ("Hardware revision", &self.hardware_revision),
            ("Software revision", &self.software_revision),
        ];
        for (label, value) in rows {
            writeln!(f, "{label:<18} {}", value.as_deref().unwrap_or("-"))?;
        }
        Ok(())
    }
}
