//! 载荷分片与重组
//!
//! 每个逻辑载荷先加上 2 字节大端长度头，再按 MTU 切成有序分片。
//! 接收端从首个分片读出总长度，按到达顺序拼接，长度满足即完成。
//!
//! ```text
//! | len (u16 BE) | payload .................................. |
//! |<------- chunk 0 ------->|<------- chunk 1 ------->| ...
//! ```
//!
//! 空载荷只发送一个 2 字节分片，接收端得到空值（即握手中的失败信号）。

/// 长度头字节数
pub const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("Payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    #[error("MTU too small: {0} (min {HEADER_LEN})")]
    MtuTooSmall(usize),

    #[error("Chunk overflows announced length: expected {expected}, received {received}")]
    Overflow { expected: usize, received: usize },
}

/// 将载荷切分为不超过 `mtu` 字节的有序分片
pub fn split(payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, ChunkError> {
    if mtu < HEADER_LEN {
        return Err(ChunkError::MtuTooSmall(mtu));
    }
    let len = u16::try_from(payload.len()).map_err(|_| ChunkError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    Ok(frame.chunks(mtu).map(<[u8]>::to_vec).collect())
}

/// 单个特征（或单个对端）的重组缓冲
#[derive(Debug, Default)]
pub struct Reassembler {
    header: Vec<u8>,
    expected: Option<usize>,
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个分片，载荷完整时返回
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, ChunkError> {
        let mut rest = chunk;

        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                let take = (HEADER_LEN - self.header.len()).min(rest.len());
                self.header.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if self.header.len() < HEADER_LEN {
                    return Ok(None);
                }
                let expected = usize::from(u16::from_be_bytes([self.header[0], self.header[1]]));
                self.header.clear();
                self.expected = Some(expected);
                expected
            }
        };

        let received = self.buffer.len() + rest.len();
        if received > expected {
            self.reset();
            return Err(ChunkError::Overflow { expected, received });
        }

        self.buffer.extend_from_slice(rest);
        if self.buffer.len() == expected {
            self.expected = None;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }

    /// 丢弃未完成的数据
    pub fn reset(&mut self) {
        self.header.clear();
        self.expected = None;
        self.buffer.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.header.is_empty() && self.expected.is_none()
    }
}
