//! PFx 帧格式
//!
//! 帧格式: `5B 5B 5B <opcode> [payload...] 5D 5D 5D`
//!
//! 响应的首字节是命令 opcode 置高位（`command | 0x80`），这是请求与响应
//! 配对的唯一依据，协议里没有序列号。

pub const FRAME_START: [u8; 3] = [0x5b, 0x5b, 0x5b];
pub const FRAME_END: [u8; 3] = [0x5d, 0x5d, 0x5d];

pub const ACK_BIT: u8 = 0x80;

pub const CMD_GET_STATUS: u8 = 0x01;
pub const CMD_GET_NAME: u8 = 0x07;
/// 注入遥控器事件，载荷为一个字节 `event | channel`
pub const CMD_REMOTE_EVENT: u8 = 0x15;

/// GET_STATUS 必须携带的固定认证载荷
const STATUS_AUTH: [u8; 7] = [0xa5, 0x5a, 0x6e, 0x40, 0x54, 0xa4, 0xe5];

/// 命令对应的响应 opcode
pub const fn response_opcode(command: u8) -> u8 {
    command | ACK_BIT
}

/// 组帧
pub fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_START.len() + 1 + payload.len() + FRAME_END.len());
    out.extend_from_slice(&FRAME_START);
    out.push(opcode);
    out.extend_from_slice(payload);
    out.extend_from_slice(&FRAME_END);
    out
}

pub fn get_status() -> Vec<u8> {
    frame(CMD_GET_STATUS, &STATUS_AUTH)
}

pub fn get_name() -> Vec<u8> {
    frame(CMD_GET_NAME, &[])
}

/// 取出一个完整帧的命令 opcode
pub fn command_opcode(frame: &[u8]) -> Option<u8> {
    if frame.len() < FRAME_START.len() + 1 + FRAME_END.len()
        || !frame.starts_with(&FRAME_START)
        || !frame.ends_with(&FRAME_END)
    {
        return None;
    }
    Some(frame[FRAME_START.len()])
}

/// 十六进制显示，用于日志
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_name_frame() {
        assert_eq!(
            get_name(),
            vec![0x5b, 0x5b, 0x5b, 0x07, 0x5d, 0x5d, 0x5d]
        );
    }

    #[test]
    fn test_get_status_frame() {
        let status = get_status();
        assert_eq!(status.len(), 14);
        assert_eq!(&status[..4], &[0x5b, 0x5b, 0x5b, 0x01]);
        assert_eq!(&status[4..11], &[0xa5, 0x5a, 0x6e, 0x40, 0x54, 0xa4, 0xe5]);
        assert_eq!(&status[11..], &FRAME_END);
    }

    #[test]
    fn test_command_opcode() {
        assert_eq!(command_opcode(&get_status()), Some(CMD_GET_STATUS));
        assert_eq!(command_opcode(&get_name()), Some(CMD_GET_NAME));
        assert_eq!(command_opcode(&[0x5b, 0x5b, 0x5d]), None);
        assert_eq!(command_opcode(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]), None);
    }

    #[test]
    fn test_response_opcode() {
        assert_eq!(response_opcode(CMD_GET_STATUS), 0x81);
        assert_eq!(response_opcode(CMD_GET_NAME), 0x87);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x5b, 0x01, 0xff]), "5B 01 FF");
    }
}
