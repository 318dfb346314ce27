//! btleplug 中心设备实现
//!
//! 适配器事件在后台任务中转换为 [`TransportEvent`]；
//! 订阅后每个通知分片同样经事件通道上报。
//! 对端以蓝牙地址字符串标识。

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::transport::{CentralRadio, TransportError, TransportEvent};
use crate::ble::{DiscoveredPeer, PeerId, RadioState};

const EVENT_CAPACITY: usize = 64;

type ScanFilterSlot = Arc<Mutex<Option<Uuid>>>;

pub struct BtleplugCentral {
    adapter: Adapter,
    tx: mpsc::Sender<TransportEvent>,
    rx: Option<mpsc::Receiver<TransportEvent>>,
    scan_filter: ScanFilterSlot,
    pump: JoinHandle<()>,
    notifications: Option<JoinHandle<()>>,
}

impl BtleplugCentral {
    /// 使用第一个可用适配器
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::RadioUnavailable(RadioState::Unsupported))?;

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let scan_filter = ScanFilterSlot::default();
        let events = adapter.events().await?;
        let pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            events,
            tx.clone(),
            scan_filter.clone(),
        ));

        debug!("Using adapter {:?}", adapter.adapter_info().await.ok());
        Ok(Self {
            adapter,
            tx,
            rx: Some(rx),
            scan_filter,
            pump,
            notifications: None,
        })
    }

    async fn find_device(&self, peer: &PeerId) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(peer.as_str())
            {
                return Ok(peripheral);
            }
        }
        Err(TransportError::PeerNotFound(peer.clone()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    fn stop_notifications(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }

    async fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransportError::EventQueueClosed)
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.pump.abort();
        self.stop_notifications();
    }
}

#[async_trait]
impl CentralRadio for BtleplugCentral {
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.take()
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        *self.scan_filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(service);
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        *self.scan_filter.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let peripheral = self.find_device(peer).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.stop_notifications();
        let peripheral = self.find_device(peer).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let peripheral = self.find_device(peer).await?;
        peripheral.discover_services().await?;

        let services = peripheral.services();
        self.emit(TransportEvent::ServicesFound {
            peer: peer.clone(),
            services: services.iter().map(|s| s.uuid).collect(),
        })
        .await?;

        for service in services {
            self.emit(TransportEvent::CharacteristicsFound {
                peer: peer.clone(),
                service: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .await?;
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
        let peripheral = self.find_device(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = if requires_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&target, chunk, write_type).await?;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.find_device(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await?;

        let mut notifications = peripheral.notifications().await?;
        let tx = self.tx.clone();
        let task_peer = peer.clone();
        self.stop_notifications();
        self.notifications = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification on {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                let event = TransportEvent::ValueUpdated {
                    peer: task_peer.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream from {task_peer} ended");
        }));
        info!("Subscribed to {characteristic} on {peer}");
        Ok(())
    }
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    tx: mpsc::Sender<TransportEvent>,
    scan_filter: ScanFilterSlot,
) {
    while let Some(event) = events.next().await {
        let mapped = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let filter = *scan_filter.lock().unwrap_or_else(PoisonError::into_inner);
                match filter {
                    Some(service) => describe(&adapter, &id, service)
                        .await
                        .map(TransportEvent::Discovered),
                    None => None,
                }
            }
            CentralEvent::DeviceConnected(id) => address_of(&adapter, &id)
                .await
                .map(|addr| TransportEvent::Connected(peer_id(addr))),
            CentralEvent::DeviceDisconnected(id) => {
                address_of(&adapter, &id)
                    .await
                    .map(|addr| TransportEvent::Disconnected {
                        peer: peer_id(addr),
                        reason: None,
                    })
            }
            _ => None,
        };

        if let Some(event) = mapped {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
    warn!("Adapter event stream ended");
}

fn peer_id(address: BDAddr) -> PeerId {
    PeerId::new(address.to_string())
}

async fn address_of(adapter: &Adapter, id: &PeripheralId) -> Option<BDAddr> {
    adapter.peripheral(id).await.ok().map(|p| p.address())
}

/// 读取广播属性；未广播目标服务的设备返回 `None`
async fn describe(adapter: &Adapter, id: &PeripheralId, service: Uuid) -> Option<DiscoveredPeer> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;
    if !props.services.contains(&service) {
        return None;
    }

    Some(DiscoveredPeer {
        local_name: props.local_name.unwrap_or_default(),
        peer_id: peer_id(props.address),
        rssi: props.rssi,
        // btleplug 只上报可连接的广播
        connectable: true,
    })
}
