//! PFx Brick 应用层协议
//!
//! - **protocol**: 帧格式与命令构造
//! - **correlator**: 通知分片重组为响应
//! - **dispatcher**: 一次一个的命令/读取调度
//! - **remote**: 遥控器事件模拟

pub mod correlator;
pub mod dispatcher;
pub mod protocol;
pub mod remote;

pub use correlator::{PfxResponse, ResponseCorrelator};
pub use dispatcher::{CommandDispatcher, Dispatch};
pub use remote::{Channel, HeldRemote, RemoteEvent, remote_command};
