//! 统一错误类型
//!
//! 各模块定义自己的错误枚举，这里汇总为调用方可见的分类。

use std::time::Duration;

use uuid::Uuid;

use crate::ble::{PeerId, RadioState, TransportError};
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::handshake::HandshakeError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::transfer::{CatalogError, RelayError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth radio unavailable ({0})")]
    RadioUnavailable(RadioState),

    #[error("No peer found within {0:?}")]
    ScanTimeout(Duration),

    #[error("Connection to {0} lost")]
    ConnectionLost(PeerId),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Room code rejected by peer")]
    AuthenticationMismatch,

    #[error("Key payload too short: {0} bytes")]
    IncompleteKeyPayload(usize),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("Relay returned {status}: {message}")]
    RelayServerError { status: u16, message: String },

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("No active role")]
    NoActiveRole,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Handshake error: {0}")]
    Handshake(HandshakeError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Secret store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// 是否值得由调用方重试
    ///
    /// 认证失败与无线电不可用永远不自动重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout(_)
                | Self::ConnectionLost(_)
                | Self::ConnectionFailed(_)
                | Self::DecryptionFailure(_)
                | Self::RelayUnavailable(_)
                | Self::RelayServerError { .. }
        )
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::RadioUnavailable(state) => Self::RadioUnavailable(state),
            TransportError::ScanTimeout(d) => Self::ScanTimeout(d),
            TransportError::ConnectionLost(peer) => Self::ConnectionLost(peer),
            TransportError::ConnectionFailed(reason) => Self::ConnectionFailed(reason),
            TransportError::ServiceNotFound(uuid) => Self::ServiceNotFound(uuid),
            TransportError::CharacteristicNotFound(uuid) => Self::CharacteristicNotFound(uuid),
            other => Self::Transport(other),
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::AuthenticationMismatch => Self::AuthenticationMismatch,
            HandshakeError::IncompleteKeyPayload(n) => Self::IncompleteKeyPayload(n),
            HandshakeError::Session(e) => Self::InvalidSession(e.to_string()),
            other => Self::Handshake(other),
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Self::InvalidSession(e.to_string())
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailure(reason) => Self::DecryptionFailure(reason),
            CryptoError::EncryptionFailure => Self::EncryptionFailure,
        }
    }
}

impl From<RelayError> for Error {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::ServerError { status, message } => {
                Self::RelayServerError { status, message }
            }
            other => Self::RelayUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_taxonomy() {
        let e: Error = TransportError::RadioUnavailable(RadioState::PoweredOff).into();
        assert!(matches!(e, Error::RadioUnavailable(RadioState::PoweredOff)));
        assert!(!e.is_retryable());

        let e: Error = TransportError::NotConnected.into();
        assert!(matches!(e, Error::Transport(TransportError::NotConnected)));
    }

    #[test]
    fn test_authentication_failure_is_not_retryable() {
        let e: Error = HandshakeError::AuthenticationMismatch.into();
        assert!(!e.is_retryable());
        let e: Error = HandshakeError::IncompleteKeyPayload(0).into();
        assert!(matches!(e, Error::IncompleteKeyPayload(0)));
    }

    #[test]
    fn test_relay_errors() {
        let e: Error = RelayError::ServerError {
            status: 404,
            message: "file not found".into(),
        }
        .into();
        assert!(matches!(e, Error::RelayServerError { status: 404, .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn test_crypto_errors_keep_direction() {
        let e: Error = CryptoError::EncryptionFailure.into();
        assert!(matches!(e, Error::EncryptionFailure));
        assert!(!e.is_retryable());

        let e: Error = CryptoError::DecryptionFailure("tag mismatch".into()).into();
        assert!(matches!(e, Error::DecryptionFailure(ref r) if r == "tag mismatch"));
    }
}
