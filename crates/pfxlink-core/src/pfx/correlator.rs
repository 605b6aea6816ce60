//! 响应重组
//!
//! 设备的响应会被拆成多个通知分片送达。这里按首字节（响应 opcode）
//! 累积分片，直到该 opcode 的长度门限满足后解码出完整响应。
//!
//! - 状态响应 (`0x81`): 累积长度超过 40 字节后完成
//!   - 硬件版本: 偏移 7..=8，大端 16 位，十六进制大写
//!   - 固件版本: 偏移 37、38，形如 `2.05`
//! - 名称响应 (`0x87`): 累积长度超过 24 字节后完成，名称从偏移 1 开始，以 NUL 结束
//! - 其他 opcode 直接视为完成，不阻塞命令队列

use log::{debug, trace};
use serde::Serialize;

use crate::pfx::protocol::{CMD_GET_NAME, CMD_GET_STATUS, hex, response_opcode};

pub const STATUS_RESPONSE: u8 = response_opcode(CMD_GET_STATUS);
pub const NAME_RESPONSE: u8 = response_opcode(CMD_GET_NAME);

/// 状态响应完成所需的最小长度
const STATUS_MIN_LEN: usize = 41;
/// 名称响应完成所需的最小长度
const NAME_MIN_LEN: usize = 25;

const HARDWARE_VERSION_OFFSET: usize = 7;
const FIRMWARE_VERSION_OFFSET: usize = 37;
const NAME_OFFSET: usize = 1;

/// 解码后的应用层响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PfxResponse {
    #[serde(rename_all = "camelCase")]
    Status {
        hardware_version: String,
        firmware_version: String,
    },
    Name {
        name: String,
    },
    /// 未识别的 opcode，原样透传
    Other {
        opcode: u8,
        data: Vec<u8>,
    },
}

impl PfxResponse {
    pub fn opcode(&self) -> u8 {
        match self {
            PfxResponse::Status { .. } => STATUS_RESPONSE,
            PfxResponse::Name { .. } => NAME_RESPONSE,
            PfxResponse::Other { opcode, .. } => *opcode,
        }
    }
}

/// 正在累积的响应
#[derive(Debug, Default)]
pub struct ResponseCorrelator {
    opcode: u8,
    accumulated: Vec<u8>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否有响应正在累积
    pub fn is_busy(&self) -> bool {
        self.opcode != 0
    }

    pub fn pending_opcode(&self) -> Option<u8> {
        self.is_busy().then_some(self.opcode)
    }

    pub fn accumulated_len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn reset(&mut self) {
        self.opcode = 0;
        self.accumulated.clear();
    }

    /// 送入一个通知分片；响应完整时返回解码结果并回到空闲
    pub fn feed(&mut self, payload: &[u8]) -> Option<PfxResponse> {
        let Some(&first) = payload.first() else {
            debug!("Ignoring empty notification payload");
            return None;
        };

        if self.opcode == 0 {
            self.opcode = first;
            self.accumulated.clear();
        }
        self.accumulated.extend_from_slice(payload);
        trace!(
            "Response 0x{:02X}: {} byte(s) accumulated [{}]",
            self.opcode,
            self.accumulated.len(),
            hex(payload)
        );

        let response = match self.opcode {
            STATUS_RESPONSE => decode_status(&self.accumulated)?,
            NAME_RESPONSE => decode_name(&self.accumulated)?,
            opcode => PfxResponse::Other {
                opcode,
                data: self.accumulated.clone(),
            },
        };

        debug!("Response 0x{:02X} complete", self.opcode);
        self.reset();
        Some(response)
    }
}

fn decode_status(data: &[u8]) -> Option<PfxResponse> {
    if data.len() < STATUS_MIN_LEN {
        return None;
    }
    let hw = u16::from_be_bytes([
        data[HARDWARE_VERSION_OFFSET],
        data[HARDWARE_VERSION_OFFSET + 1],
    ]);
    Some(PfxResponse::Status {
        hardware_version: format!("{hw:X}"),
        firmware_version: format!(
            "{:X}.{:02X}",
            data[FIRMWARE_VERSION_OFFSET],
            data[FIRMWARE_VERSION_OFFSET + 1]
        ),
    })
}

fn decode_name(data: &[u8]) -> Option<PfxResponse> {
    if data.len() < NAME_MIN_LEN {
        return None;
    }
    let name = data[NAME_OFFSET..]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect();
    Some(PfxResponse::Name { name })
}
