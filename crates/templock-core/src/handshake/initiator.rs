use log::{debug, info, warn};
use uuid::Uuid;

use super::{HandshakeError, HandshakeState};
use crate::ble::{AUTH_CHAR_UUID, GattHandler};
use crate::session::Session;

/// 需要由传输层执行的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeCommand {
    Subscribe(Uuid),
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        requires_ack: bool,
    },
}

/// Initiator 侧握手
///
/// 每个连接使用一个新实例；断开后实例进入 `Terminated` 并丢弃会话。
#[derive(Debug)]
pub struct InitiatorHandshake {
    state: HandshakeState,
    room_code: Option<String>,
    session: Option<Session>,
    subscribed: bool,
}

impl Default for InitiatorHandshake {
    fn default() -> Self {
        Self::new(None)
    }
}

impl InitiatorHandshake {
    /// `room_code` 已知时，链路就绪后立即认证
    pub fn new(room_code: Option<String>) -> Self {
        Self {
            state: HandshakeState::Idle,
            room_code: room_code.filter(|c| !c.is_empty()),
            session: None,
            subscribed: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_deref()
    }

    /// 开始扫描或连接
    pub fn await_peer(&mut self) {
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::AwaitingPeer;
        }
    }

    /// 认证特征可用：先订阅，房间码已知则紧接着写入
    pub fn on_link_ready(&mut self) -> Vec<HandshakeCommand> {
        if self.state == HandshakeState::Terminated {
            return Vec::new();
        }
        self.state = HandshakeState::AwaitingPeer;
        self.subscribed = true;

        let mut commands = vec![HandshakeCommand::Subscribe(AUTH_CHAR_UUID)];
        if let Some(code) = self.room_code.clone() {
            commands.push(self.authenticate(&code));
        }
        commands
    }

    /// 用户输入房间码；链路未就绪时先保存
    pub fn begin(&mut self, room_code: impl Into<String>) -> Result<Vec<HandshakeCommand>, HandshakeError> {
        let room_code = room_code.into();
        if room_code.is_empty() {
            return Err(HandshakeError::EmptyRoomCode);
        }
        if self.state == HandshakeState::Terminated {
            return Err(HandshakeError::UnexpectedValue(self.state));
        }

        self.room_code = Some(room_code.clone());
        if !self.subscribed {
            debug!("Link not ready, deferring authentication");
            return Ok(Vec::new());
        }
        Ok(vec![self.authenticate(&room_code)])
    }

    fn authenticate(&mut self, room_code: &str) -> HandshakeCommand {
        self.state = HandshakeState::Authenticating;
        debug!("Authenticating with room code ({} bytes)", room_code.len());
        HandshakeCommand::Write {
            characteristic: AUTH_CHAR_UUID,
            value: GattHandler::encode_auth_request(room_code),
            requires_ack: true,
        }
    }

    /// 认证特征上收到的完整通知
    ///
    /// 认证失败后回到 `AwaitingPeer`，并清除房间码，需用户重新输入。
    pub fn on_notify(&mut self, value: &[u8]) -> Result<Session, HandshakeError> {
        if self.state != HandshakeState::Authenticating {
            return Err(HandshakeError::UnexpectedValue(self.state));
        }

        match GattHandler::parse_key_delivery(value) {
            Ok(session) => {
                info!("Key received for session {}", session.session_id());
                self.state = HandshakeState::KeyExchanged;
                self.session = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                warn!("Authentication failed: {e}");
                self.state = HandshakeState::AwaitingPeer;
                self.session = None;
                self.room_code = None;
                Err(e)
            }
        }
    }

    /// 断开或放弃：丢弃会话与房间码
    pub fn terminate(&mut self) {
        self.state = HandshakeState::Terminated;
        self.session = None;
        self.room_code = None;
        self.subscribed = false;
    }
}
