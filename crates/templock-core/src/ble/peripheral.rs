//! 外围设备侧 GATT 服务
//!
//! [`PeripheralRadio`] 负责广播与原始读写；[`GattPeripheral`] 在其上做
//! 写入重组与通知分片，对上层只暴露完整载荷。
//!
//! 写入请求必须得到应答：中间分片自动回复成功，最后一个分片连同完整载荷
//! 交给上层，由上层决定 [`AttResult`]。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ble::chunk::{self, Reassembler};
use crate::ble::transport::TransportError;
use crate::ble::{AUTH_CHAR_UUID, DEFAULT_MTU, PeerId, RadioState, SERVICE_UUID};

/// ATT 写入应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttResult {
    Success,
    InsufficientAuthentication,
    UnlikelyError,
}

/// 来自中心设备的写入
#[derive(Debug)]
pub struct WriteRequest {
    pub central: PeerId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    reply: Option<oneshot::Sender<AttResult>>,
}

impl WriteRequest {
    pub fn new(
        central: PeerId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> (Self, oneshot::Receiver<AttResult>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            central,
            characteristic,
            value,
            reply: Some(tx),
        };
        (request, rx)
    }

    /// 应答写入；未应答即丢弃的请求由平台按失败处理
    pub fn respond(mut self, result: AttResult) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

#[derive(Debug)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    Subscribed { central: PeerId, characteristic: Uuid },
    Unsubscribed { central: PeerId, characteristic: Uuid },
    Write(WriteRequest),
}

/// 平台外围设备无线电
#[async_trait]
pub trait PeripheralRadio: Send {
    fn take_events(&mut self) -> Option<mpsc::Receiver<PeripheralEvent>>;

    /// 注册服务（特征可写、可通知、写入需加密）并开始广播
    async fn start_advertising(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        local_name: &str,
    ) -> Result<(), TransportError>;

    async fn stop_advertising(&mut self) -> Result<(), TransportError>;

    /// 向订阅者发送单个通知分片
    async fn notify(
        &mut self,
        central: &PeerId,
        characteristic: Uuid,
        chunk: &[u8],
    ) -> Result<(), TransportError>;
}

pub struct GattPeripheral<R: PeripheralRadio> {
    radio: R,
    events: mpsc::Receiver<PeripheralEvent>,
    service: Uuid,
    characteristic: Uuid,
    mtu: usize,
    subscribers: HashSet<PeerId>,
    reassemblers: HashMap<PeerId, Reassembler>,
    advertising: bool,
}

impl<R: PeripheralRadio> GattPeripheral<R> {
    pub fn new(mut radio: R, mtu: usize) -> Result<Self, TransportError> {
        let events = radio.take_events().ok_or(TransportError::EventQueueClosed)?;
        Ok(Self {
            radio,
            events,
            service: SERVICE_UUID,
            characteristic: AUTH_CHAR_UUID,
            mtu,
            subscribers: HashSet::new(),
            reassemblers: HashMap::new(),
            advertising: false,
        })
    }

    pub fn with_default_mtu(radio: R) -> Result<Self, TransportError> {
        Self::new(radio, DEFAULT_MTU)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_subscribed(&self, central: &PeerId) -> bool {
        self.subscribers.contains(central)
    }

    pub async fn advertise(&mut self, local_name: &str) -> Result<(), TransportError> {
        self.radio
            .start_advertising(self.service, self.characteristic, local_name)
            .await?;
        self.advertising = true;
        info!("Advertising '{local_name}' with service {}", self.service);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), TransportError> {
        self.subscribers.clear();
        self.reassemblers.clear();
        if !self.advertising {
            return Ok(());
        }
        self.advertising = false;
        self.radio.stop_advertising().await
    }

    /// 分片通知完整载荷；对端未订阅时跳过
    pub async fn notify(&mut self, central: &PeerId, payload: &[u8]) -> Result<(), TransportError> {
        if !self.subscribers.contains(central) {
            warn!("{central} is not subscribed, dropping {} byte notification", payload.len());
            return Ok(());
        }
        for piece in chunk::split(payload, self.mtu)? {
            self.radio.notify(central, self.characteristic, &piece).await?;
        }
        Ok(())
    }

    /// 等待下一个完整事件
    pub async fn next_event(&mut self) -> Result<PeripheralEvent, TransportError> {
        loop {
            let event = self
                .events
                .recv()
                .await
                .ok_or(TransportError::EventQueueClosed)?;

            match event {
                PeripheralEvent::Subscribed {
                    central,
                    characteristic,
                } => {
                    debug!("{central} subscribed to {characteristic}");
                    self.subscribers.insert(central.clone());
                    return Ok(PeripheralEvent::Subscribed {
                        central,
                        characteristic,
                    });
                }
                PeripheralEvent::Unsubscribed {
                    central,
                    characteristic,
                } => {
                    debug!("{central} unsubscribed from {characteristic}");
                    self.subscribers.remove(&central);
                    self.reassemblers.remove(&central);
                    return Ok(PeripheralEvent::Unsubscribed {
                        central,
                        characteristic,
                    });
                }
                PeripheralEvent::Write(mut request) => {
                    if request.characteristic != self.characteristic {
                        warn!("Write to unknown characteristic {}", request.characteristic);
                        request.respond(AttResult::UnlikelyError);
                        continue;
                    }
                    let reassembler = self.reassemblers.entry(request.central.clone()).or_default();
                    match reassembler.push(&request.value) {
                        Ok(Some(value)) => {
                            request.value = value;
                            return Ok(PeripheralEvent::Write(request));
                        }
                        Ok(None) => request.respond(AttResult::Success),
                        Err(e) => {
                            warn!("Discarding malformed write from {}: {e}", request.central);
                            request.respond(AttResult::UnlikelyError);
                        }
                    }
                }
                PeripheralEvent::StateChanged(state) => {
                    if !state.is_usable() {
                        self.advertising = false;
                        self.subscribers.clear();
                        self.reassemblers.clear();
                    }
                    return Ok(PeripheralEvent::StateChanged(state));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::testing::{PeripheralCall, ScriptedPeripheral};

    #[tokio::test]
    async fn test_intermediate_chunks_are_acknowledged() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut peripheral = GattPeripheral::new(radio, 20).unwrap();
        let central = PeerId::from("C1");

        let payload = b"a room code that spans several chunks".to_vec();
        let mut replies = script.write(&central, AUTH_CHAR_UUID, &payload, 20).await;
        let last = replies.pop().unwrap();

        let PeripheralEvent::Write(request) = peripheral.next_event().await.unwrap() else {
            panic!("expected write");
        };
        assert_eq!(request.value, payload);
        for reply in replies {
            assert_eq!(reply.await.unwrap(), AttResult::Success);
        }

        request.respond(AttResult::InsufficientAuthentication);
        assert_eq!(last.await.unwrap(), AttResult::InsufficientAuthentication);
    }

    #[tokio::test]
    async fn test_notify_requires_subscription() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut peripheral = GattPeripheral::new(radio, 20).unwrap();
        let central = PeerId::from("C1");

        peripheral.notify(&central, b"ignored").await.unwrap();
        assert!(script.calls().is_empty());

        script.subscribe(&central, AUTH_CHAR_UUID).await;
        peripheral.next_event().await.unwrap();
        peripheral.notify(&central, &[1u8; 40]).await.unwrap();
        assert_eq!(script.notified(&central).len(), 3);
    }

    #[tokio::test]
    async fn test_write_to_other_characteristic_is_rejected() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut peripheral = GattPeripheral::new(radio, 20).unwrap();
        let central = PeerId::from("C1");

        let replies = script.write(&central, Uuid::nil(), b"x", 20).await;
        script.subscribe(&central, AUTH_CHAR_UUID).await;

        assert!(matches!(
            peripheral.next_event().await.unwrap(),
            PeripheralEvent::Subscribed { .. }
        ));
        for reply in replies {
            assert_eq!(reply.await.unwrap(), AttResult::UnlikelyError);
        }
    }

    #[tokio::test]
    async fn test_advertise_and_stop() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut peripheral = GattPeripheral::new(radio, 20).unwrap();
        peripheral.advertise("TempLock sharing").await.unwrap();
        assert!(peripheral.is_advertising());
        peripheral.stop().await.unwrap();
        assert!(!peripheral.is_advertising());
        assert_eq!(
            script.calls(),
            vec![
                PeripheralCall::StartAdvertising {
                    service: SERVICE_UUID,
                    characteristic: AUTH_CHAR_UUID,
                    local_name: "TempLock sharing".into(),
                },
                PeripheralCall::StopAdvertising,
            ]
        );
    }
}
