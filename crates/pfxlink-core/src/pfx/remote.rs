//! 遥控器事件
//!
//! 模拟 LEGO Power Functions 红外遥控器：
//!
//! - 8879 速度遥控器: 0x00 ~ 0x18
//! - 8885 摇杆遥控器: 0x1C ~ 0x30
//! - EV3 信标: 0x34
//!
//! 事件字节的低两位是通道（0 ~ 3）。遥控器事件不经过命令调度，
//! 直接写入特征队列，设备不回应。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::PfxError;
use crate::pfx::protocol::{CMD_REMOTE_EVENT, frame};
use crate::session::SessionHandle;

/// 按住按键时的默认重复间隔
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteEvent {
    SpeedBothButtons,
    SpeedLeftButton,
    SpeedRightButton,
    SpeedLeftInc,
    SpeedLeftDec,
    SpeedRightInc,
    SpeedRightDec,
    JoystickLeftFwd,
    JoystickLeftRev,
    JoystickRightFwd,
    JoystickRightRev,
    JoystickLeftCenterOff,
    JoystickRightCenterOff,
    Ev3Beacon,
}

impl RemoteEvent {
    pub const ALL: [RemoteEvent; 14] = [
        RemoteEvent::SpeedBothButtons,
        RemoteEvent::SpeedLeftButton,
        RemoteEvent::SpeedRightButton,
        RemoteEvent::SpeedLeftInc,
        RemoteEvent::SpeedLeftDec,
        RemoteEvent::SpeedRightInc,
        RemoteEvent::SpeedRightDec,
        RemoteEvent::JoystickLeftFwd,
        RemoteEvent::JoystickLeftRev,
        RemoteEvent::JoystickRightFwd,
        RemoteEvent::JoystickRightRev,
        RemoteEvent::JoystickLeftCenterOff,
        RemoteEvent::JoystickRightCenterOff,
        RemoteEvent::Ev3Beacon,
    ];

    /// 事件码（通道位为 0）
    pub fn code(&self) -> u8 {
        match self {
            RemoteEvent::SpeedBothButtons => 0x00,
            RemoteEvent::SpeedLeftButton => 0x04,
            RemoteEvent::SpeedRightButton => 0x08,
            RemoteEvent::SpeedLeftInc => 0x0c,
            RemoteEvent::SpeedLeftDec => 0x10,
            RemoteEvent::SpeedRightInc => 0x14,
            RemoteEvent::SpeedRightDec => 0x18,
            RemoteEvent::JoystickLeftFwd => 0x1c,
            RemoteEvent::JoystickLeftRev => 0x20,
            RemoteEvent::JoystickRightFwd => 0x24,
            RemoteEvent::JoystickRightRev => 0x28,
            RemoteEvent::JoystickLeftCenterOff => 0x2c,
            RemoteEvent::JoystickRightCenterOff => 0x30,
            RemoteEvent::Ev3Beacon => 0x34,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::SpeedBothButtons => "speed-both",
            RemoteEvent::SpeedLeftButton => "speed-left",
            RemoteEvent::SpeedRightButton => "speed-right",
            RemoteEvent::SpeedLeftInc => "speed-left-inc",
            RemoteEvent::SpeedLeftDec => "speed-left-dec",
            RemoteEvent::SpeedRightInc => "speed-right-inc",
            RemoteEvent::SpeedRightDec => "speed-right-dec",
            RemoteEvent::JoystickLeftFwd => "joy-left-fwd",
            RemoteEvent::JoystickLeftRev => "joy-left-rev",
            RemoteEvent::JoystickRightFwd => "joy-right-fwd",
            RemoteEvent::JoystickRightRev => "joy-right-rev",
            RemoteEvent::JoystickLeftCenterOff => "joy-left-off",
            RemoteEvent::JoystickRightCenterOff => "joy-right-off",
            RemoteEvent::Ev3Beacon => "ev3-beacon",
        }
    }

    /// 松开按键时要发送的事件
    ///
    /// 摇杆遥控器松开后回到中位；速度遥控器松开时不发送任何东西。
    pub fn release(&self) -> Option<RemoteEvent> {
        match self {
            RemoteEvent::JoystickLeftFwd | RemoteEvent::JoystickLeftRev => {
                Some(RemoteEvent::JoystickLeftCenterOff)
            }
            RemoteEvent::JoystickRightFwd | RemoteEvent::JoystickRightRev => {
                Some(RemoteEvent::JoystickRightCenterOff)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RemoteEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        RemoteEvent::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| format!("unknown remote event '{s}'"))
    }
}

/// 遥控通道 1 ~ 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Channel(u8);

impl Channel {
    /// 从用户可见的编号（1 ~ 4）创建
    pub fn new(number: u8) -> Option<Self> {
        (1..=4).contains(&number).then(|| Self(number - 1))
    }

    /// 线上的通道位
    pub fn wire_value(self) -> u8 {
        self.0
    }

    pub fn number(self) -> u8 {
        self.0 + 1
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// 遥控器事件帧
pub fn remote_command(event: RemoteEvent, channel: Channel) -> Vec<u8> {
    frame(CMD_REMOTE_EVENT, &[event.code() | channel.wire_value()])
}

/// 被按住的遥控器按键
///
/// 按下时立即发送一次，之后每个间隔重复发送，直到 [`HeldRemote::release`]。
pub struct HeldRemote {
    event: RemoteEvent,
    channel: Channel,
    session: SessionHandle,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HeldRemote {
    pub fn press(
        session: SessionHandle,
        event: RemoteEvent,
        channel: Channel,
        interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let command = remote_command(event, channel);
        let repeater = session.clone();
        debug!("Holding {} on channel {}", event, channel);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(e) = repeater.send_command(command.clone()).await {
                            warn!("Stopping remote repeat: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            event,
            channel,
            session,
            stop: Some(stop),
            task,
        }
    }

    pub fn event(&self) -> RemoteEvent {
        self.event
    }

    /// 停止重复并发送松开事件（如果有）
    pub async fn release(mut self) -> Result<(), PfxError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;

        if let Some(release) = self.event.release() {
            debug!("Releasing {} with {}", self.event, release);
            self.session
                .send_command(remote_command(release, self.channel))
                .await?;
        }
        Ok(())
    }
}

impl Drop for HeldRemote {
    fn drop(&mut self) {
        self.task.abort();
    }
}
