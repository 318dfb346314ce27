use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose};
use log::debug;
use sha2::{Digest, Sha256};

use crate::session::SessionKey;
use crate::transfer::FileMetadata;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Encryption failed")]
    EncryptionFailure,
}

/// AES-GCM 输出：`ciphertext || tag` 与所用 IV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext_with_tag: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

impl EncryptedBlob {
    pub fn iv_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.iv)
    }
}

fn cipher_for(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<EncryptedBlob, CryptoError> {
    let iv: [u8; IV_LEN] = rand::random();
    let ciphertext_with_tag = cipher_for(key)
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailure)?;
    Ok(EncryptedBlob {
        ciphertext_with_tag,
        iv,
    })
}

pub fn decrypt(ciphertext_with_tag: &[u8], key: &SessionKey, iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext_with_tag.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailure(format!(
            "ciphertext too short: {} bytes",
            ciphertext_with_tag.len()
        )));
    }
    if iv.len() != IV_LEN {
        return Err(CryptoError::DecryptionFailure(format!(
            "invalid IV length: {}",
            iv.len()
        )));
    }
    cipher_for(key)
        .decrypt(Nonce::from_slice(iv), ciphertext_with_tag)
        .map_err(|_| CryptoError::DecryptionFailure("authentication tag mismatch".into()))
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 大小写不敏感的十六进制比较
pub fn verify_checksum(bytes: &[u8], expected: &str) -> bool {
    checksum(bytes).eq_ignore_ascii_case(expected)
}

/// 加密文件并生成上传用的元数据（IV 为实际使用的 IV）
pub fn seal_file(
    file_name: &str,
    plaintext: &[u8],
    key: &SessionKey,
) -> Result<(FileMetadata, EncryptedBlob), CryptoError> {
    let blob = encrypt(plaintext, key)?;
    let metadata = FileMetadata::new(
        file_name,
        plaintext.len() as u64,
        checksum(plaintext),
        blob.iv_base64(),
    );
    debug!(
        "Sealed {file_name}: {} -> {} bytes",
        plaintext.len(),
        blob.ciphertext_with_tag.len()
    );
    Ok((metadata, blob))
}

/// 按元数据中的 IV 解密并校验明文
pub fn open_file(
    ciphertext_with_tag: &[u8],
    metadata: &FileMetadata,
    key: &SessionKey,
) -> Result<Vec<u8>, CryptoError> {
    let iv = general_purpose::STANDARD
        .decode(metadata.iv.trim())
        .map_err(|e| CryptoError::DecryptionFailure(format!("invalid IV encoding: {e}")))?;
    let plaintext = decrypt(ciphertext_with_tag, key, &iv)?;
    if !verify_checksum(&plaintext, &metadata.checksum) {
        return Err(CryptoError::DecryptionFailure(format!(
            "checksum mismatch for {}",
            metadata.file_name
        )));
    }
    Ok(plaintext)
}
