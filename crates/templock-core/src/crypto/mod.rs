//! 文件加密
//!
//! - AES-256-GCM，每次加密随机 12 字节 IV，密文后附 16 字节认证标签
//! - SHA-256 校验和，小写十六进制
//!
//! 给定密钥即可使用，不持有任何状态。

mod cipher;

pub use cipher::{
    CryptoError, EncryptedBlob, IV_LEN, TAG_LEN, checksum, decrypt, encrypt, open_file,
    seal_file, verify_checksum,
};
