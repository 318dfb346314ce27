//! 房间码握手
//!
//! 两端各有一个不做 IO 的状态机，输入事件、输出指令：
//!
//! ```text
//! Idle -> AwaitingPeer -> Authenticating -> KeyExchanged
//!              ^               |
//!              +--- 认证失败 ---+          (断开) -> Terminated
//! ```
//!
//! 1. Initiator 订阅认证特征，然后写入房间码
//! 2. Responder 逐字节比较房间码
//! 3. 匹配：应答成功并通知 `key || 房间码`；不匹配：应答认证不足并通知空值
//! 4. Initiator 收到 ≥32 字节的通知即得到会话，否则认证失败

mod initiator;
mod responder;

pub use initiator::{HandshakeCommand, InitiatorHandshake};
pub use responder::{AuthVerdict, ResponderHandshake};

use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingPeer,
    Authenticating,
    KeyExchanged,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Room code rejected by peer")]
    AuthenticationMismatch,

    #[error("Key payload too short: {0} bytes")]
    IncompleteKeyPayload(usize),

    #[error("Room code in key payload is not valid UTF-8")]
    MalformedSessionId,

    #[error("Room code must not be empty")]
    EmptyRoomCode,

    #[error("Invalid session: {0}")]
    Session(#[from] SessionError),

    #[error("Unexpected value in state {0:?}")]
    UnexpectedValue(HandshakeState),
}

impl HandshakeError {
    /// 对端明确给出的认证失败（而非本地状态问题）
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationMismatch
                | Self::IncompleteKeyPayload(_)
                | Self::MalformedSessionId
                | Self::Session(_)
        )
    }
}
