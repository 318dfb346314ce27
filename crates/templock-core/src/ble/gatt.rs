//! 握手载荷编解码
//!
//! - 认证写入 (Initiator → Responder): 房间码的 UTF-8 字节
//! - 密钥下发通知 (Responder → Initiator): `key (32 字节) || 房间码 UTF-8`
//! - 认证失败时下发空通知；任何短于 32 字节的通知值都按失败处理

use crate::handshake::HandshakeError;
use crate::session::{KEY_LEN, Session, SessionKey};

pub struct GattHandler;

impl GattHandler {
    pub fn encode_auth_request(room_code: &str) -> Vec<u8> {
        room_code.as_bytes().to_vec()
    }

    /// 逐字节比较，不做大小写或空白归一化
    pub fn matches_room_code(received: &[u8], session_id: &str) -> bool {
        received == session_id.as_bytes()
    }

    pub fn encode_key_delivery(session: &Session) -> Vec<u8> {
        let id = session.session_id().as_bytes();
        let mut payload = Vec::with_capacity(KEY_LEN + id.len());
        payload.extend_from_slice(session.key().as_bytes());
        payload.extend_from_slice(id);
        payload
    }

    /// 认证失败信号
    pub fn rejection() -> Vec<u8> {
        Vec::new()
    }

    pub fn parse_key_delivery(value: &[u8]) -> Result<Session, HandshakeError> {
        if value.len() < KEY_LEN {
            return Err(HandshakeError::IncompleteKeyPayload(value.len()));
        }
        let (key, id) = value.split_at(KEY_LEN);
        let session_id =
            std::str::from_utf8(id).map_err(|_| HandshakeError::MalformedSessionId)?;
        let key = SessionKey::from_slice(key)?;
        Ok(Session::new(session_id, key)?)
    }
}
