use log::{info, warn};

use super::HandshakeState;
use crate::ble::{AttResult, GattHandler};
use crate::session::Session;

/// 对一次认证写入的判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// 携带待通知的 `key || 房间码`
    Accepted(Vec<u8>),
    Rejected,
}

impl AuthVerdict {
    pub fn att_result(&self) -> AttResult {
        match self {
            Self::Accepted(_) => AttResult::Success,
            Self::Rejected => AttResult::InsufficientAuthentication,
        }
    }

    /// 写入应答之后要推送的通知值
    pub fn notify_value(&self) -> Vec<u8> {
        match self {
            Self::Accepted(payload) => payload.clone(),
            Self::Rejected => GattHandler::rejection(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Responder 侧握手：持有会话，校验每次写入的房间码
#[derive(Debug)]
pub struct ResponderHandshake {
    session: Session,
    state: HandshakeState,
}

impl ResponderHandshake {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 开始广播
    pub fn await_peer(&mut self) {
        self.state = HandshakeState::AwaitingPeer;
    }

    pub fn on_auth_write(&mut self, value: &[u8]) -> AuthVerdict {
        if self.state == HandshakeState::Terminated {
            return AuthVerdict::Rejected;
        }
        self.state = HandshakeState::Authenticating;

        if GattHandler::matches_room_code(value, self.session.session_id()) {
            info!("Peer authenticated for session {}", self.session.session_id());
            self.state = HandshakeState::KeyExchanged;
            AuthVerdict::Accepted(GattHandler::encode_key_delivery(&self.session))
        } else {
            warn!("Rejected room code ({} bytes)", value.len());
            self.state = HandshakeState::AwaitingPeer;
            AuthVerdict::Rejected
        }
    }

    pub fn terminate(&mut self) {
        self.state = HandshakeState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{KEY_LEN, SessionKey};

    fn responder() -> ResponderHandshake {
        let session = Session::new("apple", SessionKey::from_bytes([5; KEY_LEN])).unwrap();
        let mut hs = ResponderHandshake::new(session);
        hs.await_peer();
        hs
    }

    #[test]
    fn test_matching_code_delivers_key() {
        let mut hs = responder();
        let verdict = hs.on_auth_write(b"apple");
        assert_eq!(verdict.att_result(), AttResult::Success);
        let payload = verdict.notify_value();
        assert_eq!(payload.len(), KEY_LEN + 5);
        assert_eq!(hs.state(), HandshakeState::KeyExchanged);
    }

    #[test]
    fn test_wrong_code_pushes_empty_value() {
        let mut hs = responder();
        let verdict = hs.on_auth_write(b"xyz");
        assert_eq!(verdict, AuthVerdict::Rejected);
        assert_eq!(verdict.att_result(), AttResult::InsufficientAuthentication);
        assert!(verdict.notify_value().is_empty());
        assert_eq!(hs.state(), HandshakeState::AwaitingPeer);
    }

    #[test]
    fn test_terminated_rejects_everything() {
        let mut hs = responder();
        hs.terminate();
        assert_eq!(hs.on_auth_write(b"apple"), AuthVerdict::Rejected);
    }
}
