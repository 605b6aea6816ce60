//! PFx Brick BLE 连接管理库
//!
//! 通过 BLE 与 Fx Bricks PFx Brick 通信：连接管理、GATT 角色解析、
//! 单在途写队列、响应重组和命令调度。
//!
//! # 模块
//!
//! - **ble**: 传输层抽象、角色解析、写队列、连接状态机、btleplug 实现
//! - **pfx**: PFx 帧格式、响应重组、命令调度、遥控器事件
//! - **session**: 串行会话任务和对外句柄
//! - **config**: 持久化设置
//!
//! # 使用示例
//!
//! ```ignore
//! use pfxlink_core::{Session, SessionEvent, Settings};
//!
//! let settings = Settings::load();
//! let session = Session::spawn_btleplug(&settings).await;
//! let mut events = session.subscribe();
//!
//! session.connect("00:1E:C0:12:34:56").await?;
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::ResponseReady(response) = event {
//!         println!("{response:?}");
//!     }
//! }
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod pfx;
pub mod session;

// BLE re-exports
pub use ble::connection::LinkState;
pub use ble::roles::{Role, RoleTable, resolve_roles};
pub use ble::transport::{
    GattStatus, LinkId, Transport, TransportError, TransportEvent, WriteMode, WriteTicket,
};
pub use ble::write_queue::QueueKind;
pub use ble::{CharHandle, CharProperties, DiscoveredCharacteristic, DiscoveredService};

// PFx re-exports
pub use pfx::{Channel, HeldRemote, PfxResponse, RemoteEvent, remote_command};

// Session re-exports
pub use session::{
    BrickInfo, GattValueStore, LinkCore, Output, Session, SessionConfig, SessionEvent,
    SessionHandle,
};

pub use config::Settings;
pub use error::PfxError;
