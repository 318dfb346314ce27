//! 测试替身
//!
//! [`ScriptedCentral`] 与 [`ScriptedPeripheral`] 不接触真实适配器：
//! 事件由测试通过句柄注入，所有指令被记录下来供断言。

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ble::chunk;
use crate::ble::peripheral::{AttResult, PeripheralEvent, PeripheralRadio, WriteRequest};
use crate::ble::transport::{CentralRadio, TransportError, TransportEvent};
use crate::ble::{AUTH_CHAR_UUID, PeerId, SERVICE_UUID};

const SCRIPT_CAPACITY: usize = 256;

/// 中心设备替身记录的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan(Uuid),
    StopScan,
    Connect(PeerId),
    Disconnect(PeerId),
    Discover(PeerId),
    Write {
        peer: PeerId,
        characteristic: Uuid,
        chunk: Vec<u8>,
        requires_ack: bool,
    },
    Subscribe {
        peer: PeerId,
        characteristic: Uuid,
    },
}

type CallLog<T> = Arc<Mutex<Vec<T>>>;
type ConnectError = Arc<Mutex<Option<String>>>;

fn record<T>(log: &CallLog<T>, call: T) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(call);
}

fn set_connect_error(slot: &ConnectError, reason: String) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
}

fn snapshot<T: Clone>(log: &CallLog<T>) -> Vec<T> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// 回放脚本事件的中心设备
pub struct ScriptedCentral {
    tx: mpsc::Sender<TransportEvent>,
    rx: Option<mpsc::Receiver<TransportEvent>>,
    calls: CallLog<CentralCall>,
    auto_link: bool,
    connect_error: ConnectError,
}

/// 测试侧句柄：注入事件、读取指令记录
#[derive(Clone)]
pub struct CentralScript {
    tx: mpsc::Sender<TransportEvent>,
    calls: CallLog<CentralCall>,
    connect_error: ConnectError,
}

impl ScriptedCentral {
    pub fn new() -> (Self, CentralScript) {
        let (tx, rx) = mpsc::channel(SCRIPT_CAPACITY);
        let calls = CallLog::default();
        let connect_error = ConnectError::default();
        let script = CentralScript {
            tx: tx.clone(),
            calls: calls.clone(),
            connect_error: connect_error.clone(),
        };
        let radio = Self {
            tx,
            rx: Some(rx),
            calls,
            auto_link: false,
            connect_error,
        };
        (radio, script)
    }

    /// 连接与服务发现时自动回报成功事件
    #[must_use]
    pub fn with_auto_link(mut self) -> Self {
        self.auto_link = true;
        self
    }

    /// 让所有连接尝试失败
    #[must_use]
    pub fn with_connect_error(self, reason: impl Into<String>) -> Self {
        set_connect_error(&self.connect_error, reason.into());
        self
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl CentralRadio for ScriptedCentral {
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.take()
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        record(&self.calls, CentralCall::StartScan(service));
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        record(&self.calls, CentralCall::StopScan);
        Ok(())
    }

    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        record(&self.calls, CentralCall::Connect(peer.clone()));
        let error = self
            .connect_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reason) = error {
            return Err(TransportError::ConnectionFailed(reason));
        }
        if self.auto_link {
            self.emit(TransportEvent::Connected(peer.clone())).await;
        }
        Ok(())
    }

    async fn disconnect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        record(&self.calls, CentralCall::Disconnect(peer.clone()));
        Ok(())
    }

    async fn discover_services(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        record(&self.calls, CentralCall::Discover(peer.clone()));
        if self.auto_link {
            for event in link_events(peer).into_iter().skip(1) {
                self.emit(event).await;
            }
        }
        Ok(())
    }

    async fn write(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
        chunk: &[u8],
        requires_ack: bool,
    ) -> Result<(), TransportError> {
        record(
            &self.calls,
            CentralCall::Write {
                peer: peer.clone(),
                characteristic,
                chunk: chunk.to_vec(),
                requires_ack,
            },
        );
        Ok(())
    }

    async fn subscribe(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        record(
            &self.calls,
            CentralCall::Subscribe {
                peer: peer.clone(),
                characteristic,
            },
        );
        Ok(())
    }
}

/// 连接成功到链路就绪的完整事件序列
fn link_events(peer: &PeerId) -> Vec<TransportEvent> {
    vec![
        TransportEvent::Connected(peer.clone()),
        TransportEvent::ServicesFound {
            peer: peer.clone(),
            services: vec![SERVICE_UUID],
        },
        TransportEvent::CharacteristicsFound {
            peer: peer.clone(),
            service: SERVICE_UUID,
            characteristics: vec![AUTH_CHAR_UUID],
        },
    ]
}

impl CentralScript {
    pub async fn push(&self, event: TransportEvent) {
        let _ = self.tx.send(event).await;
    }

    /// 注入 `Connected` → `ServicesFound` → `CharacteristicsFound`
    pub async fn push_ready_link(&self, peer: &PeerId) {
        for event in link_events(peer) {
            self.push(event).await;
        }
    }

    /// 把载荷按 MTU 分片后作为通知注入
    pub async fn notify(&self, peer: &PeerId, characteristic: Uuid, payload: &[u8], mtu: usize) {
        let Ok(chunks) = chunk::split(payload, mtu) else {
            return;
        };
        for value in chunks {
            self.push(TransportEvent::ValueUpdated {
                peer: peer.clone(),
                characteristic,
                value,
            })
            .await;
        }
    }

    /// 之后的连接尝试全部失败
    pub fn fail_connects(&self, reason: impl Into<String>) {
        set_connect_error(&self.connect_error, reason.into());
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        snapshot(&self.calls)
    }

    /// 写入到某特征的所有分片按顺序拼接（含长度头）
    pub fn written(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CentralCall::Write {
                    characteristic: c,
                    chunk,
                    ..
                } if c == characteristic => Some(chunk),
                _ => None,
            })
            .collect()
    }
}

/// 外围设备替身记录的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    StartAdvertising {
        service: Uuid,
        characteristic: Uuid,
        local_name: String,
    },
    StopAdvertising,
    Notify {
        central: PeerId,
        characteristic: Uuid,
        chunk: Vec<u8>,
    },
}

/// 回放脚本事件的外围设备
pub struct ScriptedPeripheral {
    rx: Option<mpsc::Receiver<PeripheralEvent>>,
    calls: CallLog<PeripheralCall>,
}

#[derive(Clone)]
pub struct PeripheralScript {
    tx: mpsc::Sender<PeripheralEvent>,
    calls: CallLog<PeripheralCall>,
}

impl ScriptedPeripheral {
    pub fn new() -> (Self, PeripheralScript) {
        let (tx, rx) = mpsc::channel(SCRIPT_CAPACITY);
        let calls = CallLog::default();
        (
            Self {
                rx: Some(rx),
                calls: calls.clone(),
            },
            PeripheralScript { tx, calls },
        )
    }
}

#[async_trait]
impl PeripheralRadio for ScriptedPeripheral {
    fn take_events(&mut self) -> Option<mpsc::Receiver<PeripheralEvent>> {
        self.rx.take()
    }

    async fn start_advertising(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        local_name: &str,
    ) -> Result<(), TransportError> {
        record(
            &self.calls,
            PeripheralCall::StartAdvertising {
                service,
                characteristic,
                local_name: local_name.to_string(),
            },
        );
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), TransportError> {
        record(&self.calls, PeripheralCall::StopAdvertising);
        Ok(())
    }

    async fn notify(
        &mut self,
        central: &PeerId,
        characteristic: Uuid,
        chunk: &[u8],
    ) -> Result<(), TransportError> {
        record(
            &self.calls,
            PeripheralCall::Notify {
                central: central.clone(),
                characteristic,
                chunk: chunk.to_vec(),
            },
        );
        Ok(())
    }
}

impl PeripheralScript {
    pub async fn push(&self, event: PeripheralEvent) {
        let _ = self.tx.send(event).await;
    }

    pub async fn subscribe(&self, central: &PeerId, characteristic: Uuid) {
        self.push(PeripheralEvent::Subscribed {
            central: central.clone(),
            characteristic,
        })
        .await;
    }

    /// 分片写入载荷，返回每个分片的 ATT 应答
    pub async fn write(
        &self,
        central: &PeerId,
        characteristic: Uuid,
        payload: &[u8],
        mtu: usize,
    ) -> Vec<oneshot::Receiver<AttResult>> {
        let Ok(chunks) = chunk::split(payload, mtu) else {
            return Vec::new();
        };
        let mut replies = Vec::with_capacity(chunks.len());
        for value in chunks {
            let (request, reply) = WriteRequest::new(central.clone(), characteristic, value);
            self.push(PeripheralEvent::Write(request)).await;
            replies.push(reply);
        }
        replies
    }

    pub fn calls(&self) -> Vec<PeripheralCall> {
        snapshot(&self.calls)
    }

    /// 发往某对端的通知分片
    pub fn notified(&self, central: &PeerId) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeripheralCall::Notify {
                    central: c, chunk, ..
                } if &c == central => Some(chunk),
                _ => None,
            })
            .collect()
    }
}
