//! bluer (BlueZ) 外围设备实现
//!
//! 注册一个主服务，其中只有认证特征：
//! - 写入需要加密链路，每个写入分片经事件通道交给上层并等待应答
//! - 支持通知，BlueZ 在对端订阅时交出 notifier
//!
//! BlueZ 的 notifier 不区分订阅者；单连接模型下所有对端共用 [`BLUEZ_CENTRAL`] 标识。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
};
use futures_util::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::ble::peripheral::{AttResult, PeripheralEvent, PeripheralRadio, WriteRequest};
use crate::ble::transport::TransportError;
use crate::ble::{PeerId, RadioState};

/// BlueZ 链路上对端的统一标识
pub const BLUEZ_CENTRAL: &str = "bluez-central";

const EVENT_CAPACITY: usize = 32;

type NotifierSlot = Arc<Mutex<Option<CharacteristicNotifier>>>;

pub struct BluerPeripheral {
    adapter: bluer::Adapter,
    _session: bluer::Session,
    tx: mpsc::Sender<PeripheralEvent>,
    rx: Option<mpsc::Receiver<PeripheralEvent>>,
    notifier: NotifierSlot,
    handles: Option<(AdvertisementHandle, ApplicationHandle)>,
}

impl BluerPeripheral {
    pub async fn new() -> Result<Self, TransportError> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;

        debug!("Powering on adapter: {}", adapter.name());
        if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter: {e}");
            return Err(TransportError::RadioUnavailable(RadioState::PoweredOff));
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let _ = tx.try_send(PeripheralEvent::StateChanged(RadioState::PoweredOn));

        Ok(Self {
            adapter,
            _session: session,
            tx,
            rx: Some(rx),
            notifier: NotifierSlot::default(),
            handles: None,
        })
    }

    fn auth_characteristic(&self, uuid: Uuid) -> Characteristic {
        let write_tx = self.tx.clone();
        let notify_tx = self.tx.clone();
        let slot = self.notifier.clone();

        Characteristic {
            uuid,
            write: Some(CharacteristicWrite {
                write: true,
                encrypt_write: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |data, _req| {
                    let tx = write_tx.clone();
                    async move {
                        let (request, reply) =
                            WriteRequest::new(PeerId::from(BLUEZ_CENTRAL), uuid, data);
                        tx.send(PeripheralEvent::Write(request))
                            .await
                            .map_err(|_| ReqError::Failed)?;
                        match reply.await {
                            Ok(AttResult::Success) => Ok(()),
                            Ok(AttResult::InsufficientAuthentication) => {
                                Err(ReqError::NotAuthorized)
                            }
                            Ok(AttResult::UnlikelyError) | Err(_) => Err(ReqError::Failed),
                        }
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let slot = slot.clone();
                    let tx = notify_tx.clone();
                    async move {
                        debug!("Central subscribed to {uuid}");
                        *slot.lock().await = Some(notifier);
                        let _ = tx
                            .send(PeripheralEvent::Subscribed {
                                central: PeerId::from(BLUEZ_CENTRAL),
                                characteristic: uuid,
                            })
                            .await;
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeripheralRadio for BluerPeripheral {
    fn take_events(&mut self) -> Option<mpsc::Receiver<PeripheralEvent>> {
        self.rx.take()
    }

    async fn start_advertising(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        local_name: &str,
    ) -> Result<(), TransportError> {
        let app = Application {
            services: vec![Service {
                uuid: service,
                primary: true,
                characteristics: vec![self.auth_characteristic(characteristic)],
                ..Default::default()
            }],
            ..Default::default()
        };

        debug!("Registering GATT application with service_uuid={service}");
        let app_handle = self.adapter.serve_gatt_application(app).await?;

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: BTreeSet::from([service]),
            local_name: Some(local_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        let adv_handle = self.adapter.advertise(adv).await?;

        info!("GATT server started, local_name='{local_name}'");
        self.handles = Some((adv_handle, app_handle));
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), TransportError> {
        // 句柄 drop 时注销广播与服务
        if self.handles.take().is_some() {
            info!("GATT server stopped");
        }
        *self.notifier.lock().await = None;
        Ok(())
    }

    async fn notify(
        &mut self,
        central: &PeerId,
        characteristic: Uuid,
        chunk: &[u8],
    ) -> Result<(), TransportError> {
        let mut slot = self.notifier.lock().await;
        let Some(notifier) = slot.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        if let Err(e) = notifier.notify(chunk.to_vec()).await {
            *slot = None;
            drop(slot);
            let _ = self
                .tx
                .send(PeripheralEvent::Unsubscribed {
                    central: central.clone(),
                    characteristic,
                })
                .await;
            return Err(TransportError::Radio(e.to_string()));
        }
        Ok(())
    }
}
