//! TempLock Core Library
//!
//! 近距离安全文件共享的核心实现：两台设备通过 BLE 房间码握手交换
//! 256 位会话密钥，之后经由 HTTP 中继交换 AES-GCM 加密的文件。
//!
//! # 模块
//!
//! - **ble**: BLE 传输、分片、GATT 客户端/服务器
//! - **handshake**: 房间码握手状态机（不做 IO）
//! - **crypto**: AES-256-GCM 加密和 SHA-256 校验
//! - **transfer**: 中继客户端、线格式与文件目录
//! - **workflow**: Initiator/Responder 角色与文件服务
//! - **session** / **store**: 会话密钥及其持久化
//! - **config** / **logging** / **error**: 配置、日志级别与错误
//!
//! # 使用示例
//!
//! ## 作为 Responder 共享会话
//!
//! ```ignore
//! use templock_core::{BluerPeripheral, RelayClient, Responder, ResponderOptions, Session};
//!
//! // 1. 在中继上创建会话，生成密钥
//! let relay = RelayClient::new("http://localhost:8000")?;
//! let session = Session::generate(relay.create_session().await?)?;
//!
//! // 2. 广播并等待对端输入房间码
//! let radio = BluerPeripheral::new().await?;
//! let mut responder = Responder::new(radio, session, ResponderOptions::default())?;
//! responder.start().await?;
//! loop {
//!     let event = responder.next_event().await?;
//! }
//! ```
//!
//! ## 作为 Initiator 加入会话
//!
//! ```ignore
//! use templock_core::{BtleplugCentral, Initiator, InitiatorOptions, SessionEvent};
//!
//! let radio = BtleplugCentral::new().await?;
//! let mut initiator = Initiator::new(radio, InitiatorOptions::default())?.with_room_code("abcd");
//! initiator.find_and_connect().await?;
//! loop {
//!     if let SessionEvent::KeyExchanged(session) = initiator.next_event().await? {
//!         // 使用 FileService 列表与下载
//!         break;
//!     }
//! }
//! ```

pub mod ble;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod session;
pub mod store;
pub mod transfer;
pub mod workflow;

// BLE re-exports
pub use ble::{
    AUTH_CHAR_UUID, BleTransport, BluerPeripheral, BtleplugCentral, DiscoveredPeer, PeerId,
    RadioState, SERVICE_UUID,
};

// Handshake re-exports
pub use handshake::{HandshakeError, HandshakeState, InitiatorHandshake, ResponderHandshake};

// Session re-exports
pub use session::{Session, SessionKey};
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};

// Transfer re-exports
pub use transfer::{FileCatalog, FileMetadata, FileRecord, FileState, RelayClient};

// Workflow re-exports
pub use workflow::{
    FileService, Initiator, InitiatorOptions, Responder, ResponderOptions, RoleController,
    SessionEvent,
};

pub use config::AppSettings;
pub use error::{Error, Result};
pub use logging::LogLevel;
