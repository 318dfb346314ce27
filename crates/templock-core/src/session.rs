//! 会话：房间码 + 共享对称密钥
//!
//! 密钥在内存中以 [`zeroize`] 清零，`Debug` 输出不含密钥内容。

use std::fmt;

use log::debug;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::store::{SecretStore, StoreError};

/// AES-256 密钥长度
pub const KEY_LEN: usize = 32;

const SESSION_ID_KEY: &str = "session_id";
const SESSION_KEY_KEY: &str = "session_key";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session id must not be empty")]
    EmptyId,

    #[error("Session key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
}

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// 从系统随机源生成新密钥
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SessionError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SessionError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// 房间码与密钥成对出现：不存在没有密钥的会话，也不存在没有房间码的密钥
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    key: SessionKey,
}

impl Session {
    pub fn new(session_id: impl Into<String>, key: SessionKey) -> Result<Self, SessionError> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(SessionError::EmptyId);
        }
        Ok(Self { session_id, key })
    }

    /// 以新生成的密钥创建会话
    pub fn generate(session_id: impl Into<String>) -> Result<Self, SessionError> {
        Self::new(session_id, SessionKey::generate())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn save(&self, store: &dyn SecretStore) -> Result<(), StoreError> {
        store.put(SESSION_ID_KEY, self.session_id.as_bytes())?;
        store.put(SESSION_KEY_KEY, self.key.as_bytes())?;
        debug!("Saved session {}", self.session_id);
        Ok(())
    }

    /// 两项都存在时才返回会话
    pub fn load(store: &dyn SecretStore) -> Result<Option<Self>, StoreError> {
        let (Some(id), Some(key)) = (store.get(SESSION_ID_KEY)?, store.get(SESSION_KEY_KEY)?)
        else {
            return Ok(None);
        };

        let corrupt = |key: &str, reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let session_id =
            String::from_utf8(id).map_err(|e| corrupt(SESSION_ID_KEY, e.to_string()))?;
        let key = SessionKey::from_slice(&key).map_err(|e| corrupt(SESSION_KEY_KEY, e.to_string()))?;
        let session = Self::new(session_id, key).map_err(|e| corrupt(SESSION_ID_KEY, e.to_string()))?;
        Ok(Some(session))
    }

    pub fn forget(store: &dyn SecretStore) -> Result<(), StoreError> {
        store.delete(SESSION_ID_KEY)?;
        store.delete(SESSION_KEY_KEY)?;
        debug!("Forgot stored session");
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecretStore;

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(SessionKey::generate(), SessionKey::generate());
    }

    #[test]
    fn test_debug_redacts_key() {
        let session = Session::new("apple", SessionKey::from_bytes([0xAB; KEY_LEN])).unwrap();
        let printed = format!("{session:?}");
        assert!(printed.contains("apple"));
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn test_empty_id_rejected() {
        assert_eq!(
            Session::new("", SessionKey::generate()).unwrap_err(),
            SessionError::EmptyId
        );
    }

    #[test]
    fn test_key_from_slice_length() {
        assert_eq!(
            SessionKey::from_slice(&[0u8; 16]).unwrap_err(),
            SessionError::KeyLength(16)
        );
        assert!(SessionKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_save_load_forget() {
        let store = MemorySecretStore::new();
        assert!(Session::load(&store).unwrap().is_none());

        let session = Session::generate("apple-banana").unwrap();
        session.save(&store).unwrap();
        assert_eq!(Session::load(&store).unwrap(), Some(session));

        Session::forget(&store).unwrap();
        assert!(Session::load(&store).unwrap().is_none());
    }

    #[test]
    fn test_load_partial_is_none() {
        let store = MemorySecretStore::new();
        store.put("session_id", b"apple").unwrap();
        assert!(Session::load(&store).unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_key() {
        let store = MemorySecretStore::new();
        store.put("session_id", b"apple").unwrap();
        store.put("session_key", &[1, 2, 3]).unwrap();
        assert!(matches!(
            Session::load(&store),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
