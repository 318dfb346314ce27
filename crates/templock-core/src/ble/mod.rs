//! BLE 传输层
//!
//! - **chunk**: 按 MTU 分片与重组
//! - **gatt**: 握手载荷编解码
//! - **transport**: 中心设备 (Initiator) 侧的连接状态机
//! - **peripheral**: 外围设备 (Responder) 侧的 GATT 服务封装
//! - **client** / **server**: btleplug 与 bluer 的平台实现
//! - **testing**: 回放脚本事件的测试替身（`testing` feature）

pub mod chunk;
pub mod client;
pub mod gatt;
pub mod peripheral;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use client::BtleplugCentral;
pub use gatt::GattHandler;
pub use peripheral::{AttResult, GattPeripheral, PeripheralEvent, PeripheralRadio, WriteRequest};
pub use server::BluerPeripheral;
pub use transport::{
    BleTransport, CentralRadio, Connection, TransportError, TransportEvent, TransportState,
};

use std::fmt;
use uuid::Uuid;

/// Responder 暴露的服务
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x08590f7e_db05_467e_8757_72f6faeb13d4);
/// 认证特征：Initiator 写入房间码，Responder 通过 notify 下发密钥
pub const AUTH_CHAR_UUID: Uuid = Uuid::from_u128(0x08590f7e_db05_467e_8757_72f6faeb13d5);

/// 单次写入/通知的默认载荷上限
pub const DEFAULT_MTU: usize = 20;
pub const DEFAULT_LOCAL_NAME: &str = "TempLock sharing";

/// 不透明的无线电标识（Linux 上为蓝牙地址）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// 扫描得到的对端，只在连接前短暂存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub local_name: String,
    pub peer_id: PeerId,
    pub rssi: Option<i16>,
    pub connectable: bool,
}

/// 适配器电源/授权状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl RadioState {
    /// `Unknown` 视为可用：平台尚未上报状态时不阻止操作
    pub fn is_usable(self) -> bool {
        matches!(self, RadioState::PoweredOn | RadioState::Unknown)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Unknown => "unknown",
            RadioState::PoweredOn => "powered on",
            RadioState::PoweredOff => "powered off",
            RadioState::Unauthorized => "unauthorized",
            RadioState::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}
