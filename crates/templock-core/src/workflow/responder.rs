//! Responder 工作流
//!
//! 广播 TempLock 服务，对每次认证写入先应答 ATT 结果，
//! 再向写入方通知 `key || 房间码` 或空值。

use log::{debug, info, warn};

use super::SessionEvent;
use crate::ble::{
    AUTH_CHAR_UUID, DEFAULT_LOCAL_NAME, DEFAULT_MTU, GattPeripheral, PeripheralEvent,
    PeripheralRadio,
};
use crate::config::AppSettings;
use crate::error::Result;
use crate::handshake::{HandshakeState, ResponderHandshake};
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct ResponderOptions {
    pub local_name: String,
    pub mtu: usize,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self {
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            mtu: DEFAULT_MTU,
        }
    }
}

impl From<&AppSettings> for ResponderOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            local_name: settings.device_name.clone(),
            mtu: settings.mtu,
        }
    }
}

pub struct Responder<R: PeripheralRadio> {
    peripheral: GattPeripheral<R>,
    handshake: ResponderHandshake,
    options: ResponderOptions,
}

impl<R: PeripheralRadio> Responder<R> {
    pub fn new(radio: R, session: Session, options: ResponderOptions) -> Result<Self> {
        Ok(Self {
            peripheral: GattPeripheral::new(radio, options.mtu)?,
            handshake: ResponderHandshake::new(session),
            options,
        })
    }

    pub fn session(&self) -> &Session {
        self.handshake.session()
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_advertising(&self) -> bool {
        self.peripheral.is_advertising()
    }

    /// 开始广播
    pub async fn start(&mut self) -> Result<()> {
        self.peripheral.advertise(&self.options.local_name).await?;
        self.handshake.await_peer();
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.handshake.terminate();
        self.peripheral.stop().await?;
        info!("Responder stopped");
        Ok(())
    }

    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        loop {
            match self.peripheral.next_event().await? {
                PeripheralEvent::Subscribed {
                    central,
                    characteristic,
                } => {
                    if characteristic == AUTH_CHAR_UUID {
                        return Ok(SessionEvent::Connected(central));
                    }
                }

                PeripheralEvent::Unsubscribed { central, .. } => {
                    return Ok(SessionEvent::Disconnected {
                        peer: central,
                        reason: None,
                    });
                }

                PeripheralEvent::Write(request) => {
                    let central = request.central.clone();
                    let verdict = self.handshake.on_auth_write(&request.value);
                    // 先应答写入，再推送通知
                    request.respond(verdict.att_result());
                    if let Err(e) = self
                        .peripheral
                        .notify(&central, &verdict.notify_value())
                        .await
                    {
                        warn!("Failed to notify {central}: {e}");
                    }
                    if verdict.is_accepted() {
                        return Ok(SessionEvent::PeerAuthenticated(central));
                    }
                    debug!("Room code from {central} rejected");
                    return Ok(SessionEvent::PeerRejected(central));
                }

                PeripheralEvent::StateChanged(state) => {
                    if !state.is_usable() {
                        return Ok(SessionEvent::RadioUnavailable(state));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::testing::{PeripheralCall, ScriptedPeripheral};
    use crate::ble::{AttResult, GattHandler, PeerId, RadioState, SERVICE_UUID};
    use crate::session::{KEY_LEN, SessionKey};

    fn session() -> Session {
        Session::new("abcd", SessionKey::from_bytes([3; KEY_LEN])).unwrap()
    }

    #[tokio::test]
    async fn test_start_advertises_local_name() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut responder = Responder::new(radio, session(), ResponderOptions::default()).unwrap();
        responder.start().await.unwrap();

        assert!(responder.is_advertising());
        assert_eq!(responder.state(), HandshakeState::AwaitingPeer);
        assert_eq!(
            script.calls(),
            vec![PeripheralCall::StartAdvertising {
                service: SERVICE_UUID,
                characteristic: AUTH_CHAR_UUID,
                local_name: "TempLock sharing".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_accepts_matching_code() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut responder = Responder::new(radio, session(), ResponderOptions::default()).unwrap();
        responder.start().await.unwrap();
        let central = PeerId::from("C1");

        script.subscribe(&central, AUTH_CHAR_UUID).await;
        assert!(matches!(responder.next_event().await.unwrap(), SessionEvent::Connected(_)));

        let mut replies = script.write(&central, AUTH_CHAR_UUID, b"abcd", 20).await;
        assert!(matches!(
            responder.next_event().await.unwrap(),
            SessionEvent::PeerAuthenticated(_)
        ));
        assert_eq!(replies.pop().unwrap().await.unwrap(), AttResult::Success);

        let delivered: Vec<u8> = script
            .notified(&central)
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect();
        let expected = GattHandler::encode_key_delivery(&session());
        assert_eq!(&delivered[..2], &[0, 36]);
        assert_eq!(delivered.len(), 2 + expected.len());
        assert_eq!(
            delivered.into_iter().skip(2).collect::<Vec<_>>(),
            expected
        );
    }

    #[tokio::test]
    async fn test_rejects_wrong_code_with_empty_notify() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut responder = Responder::new(radio, session(), ResponderOptions::default()).unwrap();
        responder.start().await.unwrap();
        let central = PeerId::from("C1");

        script.subscribe(&central, AUTH_CHAR_UUID).await;
        responder.next_event().await.unwrap();

        let mut replies = script.write(&central, AUTH_CHAR_UUID, b"xyz", 20).await;
        assert!(matches!(
            responder.next_event().await.unwrap(),
            SessionEvent::PeerRejected(_)
        ));
        assert_eq!(
            replies.pop().unwrap().await.unwrap(),
            AttResult::InsufficientAuthentication
        );
        assert_eq!(script.notified(&central), vec![vec![0, 0]]);
        assert_eq!(responder.state(), HandshakeState::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_radio_off_and_stop() {
        let (radio, script) = ScriptedPeripheral::new();
        let mut responder = Responder::new(radio, session(), ResponderOptions::default()).unwrap();
        responder.start().await.unwrap();

        script
            .push(PeripheralEvent::StateChanged(RadioState::PoweredOff))
            .await;
        assert!(matches!(
            responder.next_event().await.unwrap(),
            SessionEvent::RadioUnavailable(RadioState::PoweredOff)
        ));

        responder.stop().await.unwrap();
        assert_eq!(responder.state(), HandshakeState::Terminated);
    }
}
