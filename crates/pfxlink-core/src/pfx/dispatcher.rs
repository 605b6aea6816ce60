//! 命令调度
//!
//! 应用命令和设备信息读取共用一个"在途"槽位：
//!
//! - 同一时间只有一个命令或一个读取在途
//! - 响应重组器仍在累积时不释放下一个命令
//! - 命令优先于读取
//!
//! 这里只决定"下一步做什么"，真正的写入和读取由调用方提交。

use std::collections::VecDeque;

use log::debug;

use crate::ble::CharHandle;

/// `dispatch_next` 的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// 两个队列都为空
    Idle,
    /// 有待发送的项，但前一个还没结束
    Busy,
    /// 把这个命令帧写入命令特征
    Command(Vec<u8>),
    /// 读取这个特征
    Read(CharHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InFlight {
    Command,
    Read(CharHandle),
}

#[derive(Debug, Default)]
pub struct CommandDispatcher {
    commands: VecDeque<Vec<u8>>,
    reads: VecDeque<CharHandle>,
    in_flight: Option<InFlight>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// 队列为空且没有在途项
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.commands.is_empty() && self.reads.is_empty()
    }

    /// 命令入队尾
    pub fn push(&mut self, command: Vec<u8>) {
        self.commands.push_back(command);
    }

    /// 特征读取入队尾
    pub fn queue_read(&mut self, handle: CharHandle) {
        self.reads.push_back(handle);
    }

    /// 取出下一项并标记为在途
    pub fn dispatch_next(&mut self, correlator_busy: bool) -> Dispatch {
        if self.commands.is_empty() && self.reads.is_empty() {
            return Dispatch::Idle;
        }
        if self.in_flight.is_some() || correlator_busy {
            return Dispatch::Busy;
        }

        if let Some(command) = self.commands.pop_front() {
            self.in_flight = Some(InFlight::Command);
            return Dispatch::Command(command);
        }
        match self.reads.pop_front() {
            Some(handle) => {
                self.in_flight = Some(InFlight::Read(handle));
                Dispatch::Read(handle)
            }
            None => Dispatch::Idle,
        }
    }

    /// 一个响应重组完成，释放在途命令
    pub fn on_response_complete(&mut self) {
        if self.in_flight == Some(InFlight::Command) {
            self.in_flight = None;
        }
    }

    /// 命令没能写到设备（写入失败或被丢弃），不会再有响应
    pub fn on_command_failed(&mut self) {
        if self.in_flight == Some(InFlight::Command) {
            debug!("Releasing command slot after failed write");
            self.in_flight = None;
        }
    }

    /// 读取结束（成功或失败）；返回 `false` 表示不是当前在途的读取
    pub fn on_read_complete(&mut self, handle: &CharHandle) -> bool {
        match &self.in_flight {
            Some(InFlight::Read(h)) if h == handle => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        let (c, r) = (self.commands.len(), self.reads.len());
        if c + r > 0 {
            debug!("Dropped {c} queued command(s) and {r} queued read(s)");
        }
        self.commands.clear();
        self.reads.clear();
        self.in_flight = None;
    }
}
