//! Initiator 工作流
//!
//! 1. 扫描广播了 TempLock 服务的对端
//! 2. 连接并发现服务
//! 3. 订阅认证特征，写入房间码
//! 4. 收到 `key || 房间码` 通知后得到会话
//!
//! 意外断开且重连策略开启时，在处理任何其他事件之前重新发起连接，
//! 并以保留的房间码开始新的握手。

use std::time::Duration;

use futures_util::{StreamExt, pin_mut};
use log::{debug, info, warn};

use super::{ReconnectPolicy, SessionEvent};
use crate::ble::{
    AUTH_CHAR_UUID, BleTransport, CentralRadio, DEFAULT_MTU, DiscoveredPeer, PeerId,
    TransportError, TransportEvent, TransportState,
};
use crate::config::AppSettings;
use crate::error::{Error, Result};
use crate::handshake::{HandshakeCommand, HandshakeState, InitiatorHandshake};
use crate::session::Session;

/// Initiator 选项
#[derive(Debug, Clone)]
pub struct InitiatorOptions {
    pub scan_timeout: Duration,
    pub mtu: usize,
    pub auto_reconnect: bool,
}

impl Default for InitiatorOptions {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(30),
            mtu: DEFAULT_MTU,
            auto_reconnect: true,
        }
    }
}

impl From<&AppSettings> for InitiatorOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            scan_timeout: settings.scan_timeout(),
            mtu: settings.mtu,
            auto_reconnect: settings.auto_reconnect,
        }
    }
}

pub struct Initiator<R: CentralRadio> {
    transport: BleTransport<R>,
    handshake: InitiatorHandshake,
    policy: ReconnectPolicy,
    room_code: Option<String>,
    options: InitiatorOptions,
}

impl<R: CentralRadio> Initiator<R> {
    pub fn new(radio: R, options: InitiatorOptions) -> Result<Self> {
        Ok(Self {
            transport: BleTransport::new(radio, options.mtu)?,
            handshake: InitiatorHandshake::default(),
            policy: ReconnectPolicy::new(options.auto_reconnect),
            room_code: None,
            options,
        })
    }

    /// 预先提供房间码，链路就绪后自动认证
    #[must_use]
    pub fn with_room_code(mut self, room_code: impl Into<String>) -> Self {
        let room_code = room_code.into();
        self.handshake = InitiatorHandshake::new(Some(room_code.clone()));
        self.room_code = Some(room_code);
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn session(&self) -> Option<&Session> {
        self.handshake.session()
    }

    pub fn transport(&self) -> &BleTransport<R> {
        &self.transport
    }

    /// 扫描并返回第一个可连接的对端
    pub async fn find_peer(&mut self) -> Result<DiscoveredPeer> {
        self.handshake.await_peer();
        let timeout = self.options.scan_timeout;

        let found = {
            let scan = self.transport.scan(timeout);
            pin_mut!(scan);
            let mut found = Ok(None);
            while let Some(peer) = scan.next().await {
                match peer {
                    Ok(peer) if peer.connectable => {
                        found = Ok(Some(peer));
                        break;
                    }
                    Ok(peer) => debug!("Skipping non-connectable {}", peer.peer_id),
                    Err(e) => {
                        found = Err(e);
                        break;
                    }
                }
            }
            found
        };
        // 提前结束的扫描流不会自行停止
        self.transport.stop_scan().await?;

        match found? {
            Some(peer) => {
                info!("Found {} ({})", peer.local_name, peer.peer_id);
                Ok(peer)
            }
            None => Err(Error::ScanTimeout(timeout)),
        }
    }

    pub async fn connect(&mut self, peer: &PeerId) -> Result<()> {
        self.handshake.await_peer();
        self.transport.connect(peer).await?;
        Ok(())
    }

    /// 扫描并连接；扫描窗口内没有对端时返回 `ScanTimeout`
    pub async fn find_and_connect(&mut self) -> Result<DiscoveredPeer> {
        let peer = self.find_peer().await?;
        self.connect(&peer.peer_id).await?;
        Ok(peer)
    }

    /// 输入房间码；链路未就绪时在就绪后发送
    pub async fn begin(&mut self, room_code: impl Into<String>) -> Result<()> {
        let room_code = room_code.into();
        let commands = self.handshake.begin(room_code.clone())?;
        self.room_code = Some(room_code);
        self.execute(commands).await
    }

    /// 主动断开：先关闭重连，再拆除连接与会话
    pub async fn disconnect(&mut self) -> Result<()> {
        self.policy.disarm();
        self.handshake.terminate();
        self.room_code = None;
        self.transport.disconnect().await?;
        Ok(())
    }

    async fn execute(&mut self, commands: Vec<HandshakeCommand>) -> Result<()> {
        for command in commands {
            match command {
                HandshakeCommand::Subscribe(characteristic) => {
                    self.transport.subscribe(characteristic).await?;
                }
                HandshakeCommand::Write {
                    characteristic,
                    value,
                    requires_ack,
                } => {
                    self.transport
                        .write(characteristic, &value, requires_ack)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// 连接级故障：拆除连接，不重连
    async fn fail(&mut self, error: Error) -> SessionEvent {
        warn!("Connection failed: {error}");
        if let Err(e) = self.disconnect().await {
            debug!("Teardown after failure: {e}");
        }
        SessionEvent::Failed(error)
    }

    /// 处理下一个会话层事件
    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        loop {
            let event = match self.transport.next_event().await {
                Ok(event) => event,
                Err(TransportError::EventQueueClosed) => {
                    return Err(TransportError::EventQueueClosed.into());
                }
                Err(TransportError::Chunk(e)) => {
                    warn!("Dropping malformed notification: {e}");
                    continue;
                }
                Err(e) => return Ok(self.fail(e.into()).await),
            };

            match event {
                TransportEvent::StateChanged(state) => {
                    if !state.is_usable() {
                        self.policy.disarm();
                        self.handshake.terminate();
                        return Ok(SessionEvent::RadioUnavailable(state));
                    }
                }

                TransportEvent::Discovered(_) | TransportEvent::ServicesFound { .. } => {}

                TransportEvent::Connected(peer) => {
                    self.policy.on_connected(&peer);
                    if let Err(e) = self.transport.discover().await {
                        return Ok(self.fail(e.into()).await);
                    }
                    return Ok(SessionEvent::Connected(peer));
                }

                TransportEvent::CharacteristicsFound { peer, .. } => {
                    if self.transport.state() != TransportState::Ready {
                        continue;
                    }
                    let commands = self.handshake.on_link_ready();
                    if let Err(e) = self.execute(commands).await {
                        return Ok(self.fail(e).await);
                    }
                    return Ok(SessionEvent::Ready(peer));
                }

                TransportEvent::ValueUpdated {
                    peer,
                    characteristic,
                    value,
                } => {
                    if characteristic != AUTH_CHAR_UUID {
                        continue;
                    }
                    match self.handshake.on_notify(&value) {
                        Ok(session) => return Ok(SessionEvent::KeyExchanged(session)),
                        Err(e) if e.is_authentication_failure() => {
                            self.room_code = None;
                            return Ok(SessionEvent::AuthenticationFailed(peer));
                        }
                        Err(e) => debug!("Ignoring notification: {e}"),
                    }
                }

                TransportEvent::Disconnected { peer, reason } => {
                    self.handshake.terminate();
                    if let Some(peer) = self.policy.on_unexpected_disconnect(&peer) {
                        info!("Reconnecting to {peer}");
                        self.handshake = InitiatorHandshake::new(self.room_code.clone());
                        self.handshake.await_peer();
                        if let Err(e) = self.transport.connect(&peer).await {
                            return Ok(self.fail(e.into()).await);
                        }
                        return Ok(SessionEvent::Reconnecting(peer));
                    }
                    self.room_code = None;
                    return Ok(SessionEvent::Disconnected { peer, reason });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::testing::{CentralCall, ScriptedCentral};
    use crate::ble::{GattHandler, SERVICE_UUID};
    use crate::session::{KEY_LEN, SessionKey};

    fn options() -> InitiatorOptions {
        InitiatorOptions {
            scan_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scan_timeout_when_nothing_found() {
        let (radio, _script) = ScriptedCentral::new();
        let mut initiator = Initiator::new(radio, options()).unwrap();
        assert!(matches!(
            initiator.find_and_connect().await,
            Err(Error::ScanTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_then_manual_code() {
        let (radio, script) = ScriptedCentral::new();
        let radio = radio.with_auto_link();
        let mut initiator = Initiator::new(radio, options()).unwrap();
        let peer = PeerId::from("AA");

        initiator.connect(&peer).await.unwrap();
        assert!(matches!(initiator.next_event().await.unwrap(), SessionEvent::Connected(_)));
        assert!(matches!(initiator.next_event().await.unwrap(), SessionEvent::Ready(_)));
        assert!(script.written(AUTH_CHAR_UUID).is_empty());

        initiator.begin("apple").await.unwrap();
        assert_eq!(script.written(AUTH_CHAR_UUID), vec![b"\x00\x05apple".to_vec()]);
        assert_eq!(initiator.state(), HandshakeState::Authenticating);

        let session = Session::new("apple", SessionKey::from_bytes([1; KEY_LEN])).unwrap();
        script
            .notify(&peer, AUTH_CHAR_UUID, &GattHandler::encode_key_delivery(&session), 20)
            .await;
        let SessionEvent::KeyExchanged(received) = initiator.next_event().await.unwrap() else {
            panic!("expected key exchange");
        };
        assert_eq!(received, session);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let (radio, script) = ScriptedCentral::new();
        let mut initiator = Initiator::new(radio.with_auto_link(), options()).unwrap();
        let peer = PeerId::from("AA");
        initiator.connect(&peer).await.unwrap();
        initiator.next_event().await.unwrap();
        initiator.next_event().await.unwrap();

        initiator.disconnect().await.unwrap();
        assert_eq!(initiator.state(), HandshakeState::Terminated);
        assert_eq!(initiator.transport_state(), TransportState::Disconnected);

        let connects = script
            .calls()
            .into_iter()
            .filter(|c| matches!(c, CentralCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert!(script.calls().contains(&CentralCall::Disconnect(peer)));
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_connection() {
        let (radio, script) = ScriptedCentral::new();
        let mut initiator = Initiator::new(radio, options()).unwrap();
        let peer = PeerId::from("AA");
        initiator.connect(&peer).await.unwrap();

        script.push(TransportEvent::Connected(peer.clone())).await;
        script
            .push(TransportEvent::ServicesFound {
                peer: peer.clone(),
                services: vec![SERVICE_UUID],
            })
            .await;
        script
            .push(TransportEvent::CharacteristicsFound {
                peer: peer.clone(),
                service: SERVICE_UUID,
                characteristics: vec![],
            })
            .await;

        assert!(matches!(initiator.next_event().await.unwrap(), SessionEvent::Connected(_)));
        assert!(matches!(
            initiator.next_event().await.unwrap(),
            SessionEvent::Failed(Error::CharacteristicNotFound(_))
        ));
        assert_eq!(initiator.transport_state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_find_peer_stops_scan() {
        let (radio, script) = ScriptedCentral::new();
        let mut initiator = Initiator::new(radio, options()).unwrap();
        script
            .push(TransportEvent::Discovered(DiscoveredPeer {
                local_name: "TempLock sharing".into(),
                peer_id: PeerId::from("AA"),
                rssi: Some(-40),
                connectable: true,
            }))
            .await;

        let peer = initiator.find_peer().await.unwrap();
        assert_eq!(peer.peer_id, PeerId::from("AA"));
        assert!(!initiator.transport().is_scanning());
        assert_eq!(
            script.calls(),
            vec![CentralCall::StartScan(SERVICE_UUID), CentralCall::StopScan]
        );

        // 停止后到达的发现事件不再上报
        script
            .push(TransportEvent::Discovered(DiscoveredPeer {
                local_name: "late".into(),
                peer_id: PeerId::from("BB"),
                rssi: None,
                connectable: true,
            }))
            .await;
        script
            .push(TransportEvent::StateChanged(crate::ble::RadioState::PoweredOff))
            .await;
        assert!(matches!(
            initiator.next_event().await.unwrap(),
            SessionEvent::RadioUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_reconnect_reports_failure() {
        let (radio, script) = ScriptedCentral::new();
        let mut initiator = Initiator::new(radio.with_auto_link(), options()).unwrap();
        let peer = PeerId::from("AA");
        initiator.connect(&peer).await.unwrap();
        initiator.next_event().await.unwrap();
        initiator.next_event().await.unwrap();

        script.fail_connects("out of range");
        script
            .push(TransportEvent::Disconnected {
                peer: peer.clone(),
                reason: Some("timeout".into()),
            })
            .await;

        assert!(matches!(
            initiator.next_event().await.unwrap(),
            SessionEvent::Failed(Error::ConnectionFailed(_))
        ));
        assert_eq!(initiator.transport_state(), TransportState::Disconnected);
        assert_eq!(initiator.state(), HandshakeState::Terminated);
        let connects = script
            .calls()
            .into_iter()
            .filter(|c| matches!(c, CentralCall::Connect(_)))
            .count();
        assert_eq!(connects, 2);
    }
}
