//! 中心设备侧传输
//!
//! [`CentralRadio`] 是平台无线电的最小抽象：发出指令，通过事件通道回报结果。
//! [`BleTransport`] 在其之上维护唯一的连接状态机：
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ServicesDiscovered -> Ready
//!       ^                                                           |
//!       +------------------------- 断开 -----------------------------+
//! ```
//!
//! 所有事件都在调用 [`BleTransport::next_event`] 的任务上按顺序处理，
//! 不会与状态变更并发交错。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::chunk::{self, ChunkError, Reassembler};
use crate::ble::{AUTH_CHAR_UUID, DEFAULT_MTU, DiscoveredPeer, PeerId, RadioState, SERVICE_UUID};

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Bluetooth radio unavailable ({0})")]
    RadioUnavailable(RadioState),

    #[error("No peer found within {0:?}")]
    ScanTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to {0} lost")]
    ConnectionLost(PeerId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected to {0}")]
    AlreadyConnected(PeerId),

    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Radio event channel closed")]
    EventQueueClosed,

    #[error("Radio error: {0}")]
    Radio(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => Self::RadioUnavailable(RadioState::Unauthorized),
            btleplug::Error::NotConnected => Self::NotConnected,
            other => Self::Radio(other.to_string()),
        }
    }
}

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        Self::Radio(e.to_string())
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Ready,
}

/// 当前唯一的连接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub peer: PeerId,
    pub state: TransportState,
}

/// 无线电事件
///
/// 平台实现上报的 `ValueUpdated` 携带单个分片；
/// 经 [`BleTransport::next_event`] 处理后携带重组完成的完整载荷。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(RadioState),
    Discovered(DiscoveredPeer),
    Connected(PeerId),
    ServicesFound {
        peer: PeerId,
        services: Vec<Uuid>,
    },
    CharacteristicsFound {
        peer: PeerId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    ValueUpdated {
        peer: PeerId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnected {
        peer: PeerId,
        reason: Option<String>,
    },
}

/// 平台中心设备无线电
#[async_trait]
pub trait CentralRadio: Send {
    /// 取出事件接收端，只能取一次
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError>;

    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    async fn disconnect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    /// 发现服务与特征，结果以 `ServicesFound` / `CharacteristicsFound` 事件上报
    async fn discover_services(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    /// 写入单个分片
    async fn write(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
        chunk: &[u8],
        requires_ack: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, peer: &PeerId, characteristic: Uuid)
    -> Result<(), TransportError>;
}

/// 单连接 BLE 传输
pub struct BleTransport<R: CentralRadio> {
    radio: R,
    events: mpsc::Receiver<TransportEvent>,
    radio_state: RadioState,
    connection: Option<Connection>,
    service: Uuid,
    characteristic: Uuid,
    characteristics: HashSet<Uuid>,
    reassemblers: HashMap<Uuid, Reassembler>,
    scanning: bool,
    mtu: usize,
}

impl<R: CentralRadio> BleTransport<R> {
    pub fn new(mut radio: R, mtu: usize) -> Result<Self, TransportError> {
        let events = radio.take_events().ok_or(TransportError::EventQueueClosed)?;
        Ok(Self {
            radio,
            events,
            radio_state: RadioState::Unknown,
            connection: None,
            service: SERVICE_UUID,
            characteristic: AUTH_CHAR_UUID,
            characteristics: HashSet::new(),
            reassemblers: HashMap::new(),
            scanning: false,
            mtu,
        })
    }

    /// 使用默认 MTU 创建
    pub fn with_default_mtu(radio: R) -> Result<Self, TransportError> {
        Self::new(radio, DEFAULT_MTU)
    }

    /// 覆盖发现阶段要求存在的服务与特征
    #[must_use]
    pub fn with_profile(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service = service;
        self.characteristic = characteristic;
        self
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn state(&self) -> TransportState {
        self.connection
            .as_ref()
            .map_or(TransportState::Disconnected, |c| c.state)
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// 扫描广播了目标服务的对端
    ///
    /// 返回惰性流：首次轮询时开始扫描，超时后停止扫描并结束。
    /// 同一对端只在首次出现或名称/可连接性变化时产出。
    /// 已有连接时拒绝扫描，因此扫描期间到达的非发现事件可以丢弃。
    /// 提前丢弃流不会停止扫描，调用方需随后调用 [`Self::stop_scan`]。
    pub fn scan(
        &mut self,
        timeout: Duration,
    ) -> impl Stream<Item = Result<DiscoveredPeer, TransportError>> + '_ {
        let state = ScanState {
            deadline: tokio::time::Instant::now() + timeout,
            transport: self,
            seen: HashMap::new(),
            started: false,
            done: false,
        };

        futures_util::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if !st.started {
                st.started = true;
                let service = st.transport.service;
                if let Err(e) = st.transport.start_scan(service).await {
                    st.done = true;
                    return Some((Err(e), st));
                }
            }

            loop {
                let next = tokio::select! {
                    () = tokio::time::sleep_until(st.deadline) => None,
                    event = st.transport.events.recv() => Some(event),
                };

                let event = match next {
                    None => {
                        debug!("Scan window elapsed");
                        st.done = true;
                        if let Err(e) = st.transport.stop_scan().await {
                            warn!("Failed to stop scan: {e}");
                        }
                        return None;
                    }
                    Some(None) => {
                        st.done = true;
                        st.transport.scanning = false;
                        return Some((Err(TransportError::EventQueueClosed), st));
                    }
                    Some(Some(event)) => event,
                };

                match event {
                    TransportEvent::Discovered(peer) => {
                        let fingerprint = (peer.local_name.clone(), peer.connectable);
                        if st.seen.get(&peer.peer_id) == Some(&fingerprint) {
                            trace!("Duplicate advertisement from {}", peer.peer_id);
                            continue;
                        }
                        st.seen.insert(peer.peer_id.clone(), fingerprint);
                        debug!("Discovered {} ({})", peer.local_name, peer.peer_id);
                        return Some((Ok(peer), st));
                    }
                    TransportEvent::StateChanged(state) => {
                        st.transport.radio_state = state;
                        if !state.is_usable() {
                            st.done = true;
                            st.transport.scanning = false;
                            return Some((Err(TransportError::RadioUnavailable(state)), st));
                        }
                    }
                    other => trace!("Ignoring event while scanning: {other:?}"),
                }
            }
        })
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        if !self.radio_state.is_usable() {
            return Err(TransportError::RadioUnavailable(self.radio_state));
        }
        if let Some(connection) = &self.connection {
            return Err(TransportError::AlreadyConnected(connection.peer.clone()));
        }
        self.radio.start_scan(service).await?;
        self.scanning = true;
        info!("Scanning for service {service}");
        Ok(())
    }

    /// 停止扫描，之后到达的发现事件会被丢弃
    pub async fn stop_scan(&mut self) -> Result<(), TransportError> {
        if !self.scanning {
            return Ok(());
        }
        self.scanning = false;
        self.radio.stop_scan().await
    }

    /// 连接对端，结果以 `Connected` 事件回报
    pub async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        if !self.radio_state.is_usable() {
            return Err(TransportError::RadioUnavailable(self.radio_state));
        }
        self.stop_scan().await?;
        self.clear_link();
        self.connection = Some(Connection {
            peer: peer.clone(),
            state: TransportState::Connecting,
        });

        info!("Connecting to {peer}");
        if let Err(e) = self.radio.connect(peer).await {
            self.connection = None;
            return Err(match e {
                TransportError::RadioUnavailable(_)
                | TransportError::PeerNotFound(_)
                | TransportError::ConnectionFailed(_) => e,
                other => TransportError::ConnectionFailed(other.to_string()),
            });
        }
        Ok(())
    }

    /// 发现服务与特征，完成后状态变为 `Ready`
    pub async fn discover(&mut self) -> Result<(), TransportError> {
        let peer = self.connected_peer()?;
        debug!("Discovering services on {peer}");
        self.radio.discover_services(&peer).await
    }

    /// 分片写入完整载荷
    pub async fn write(
        &mut self,
        characteristic: Uuid,
        bytes: &[u8],
        requires_ack: bool,
    ) -> Result<(), TransportError> {
        let peer = self.ready_peer(characteristic)?;
        let chunks = chunk::split(bytes, self.mtu)?;
        debug!(
            "Writing {} bytes to {characteristic} in {} chunk(s)",
            bytes.len(),
            chunks.len()
        );
        for piece in &chunks {
            self.radio
                .write(&peer, characteristic, piece, requires_ack)
                .await?;
        }
        Ok(())
    }

    pub async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let peer = self.ready_peer(characteristic)?;
        debug!("Subscribing to {characteristic}");
        self.radio.subscribe(&peer, characteristic).await
    }

    /// 主动断开，清理所有句柄；之后到达的断开事件不会再上报
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_scan().await?;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        self.clear_link();
        info!("Disconnecting from {}", connection.peer);
        self.radio.disconnect(&connection.peer).await
    }

    /// 等待下一个需要上层处理的事件
    pub async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            let event = self
                .events
                .recv()
                .await
                .ok_or(TransportError::EventQueueClosed)?;
            if let Some(event) = self.apply(event)? {
                return Ok(event);
            }
        }
    }

    /// 应用事件到状态机；返回 `None` 表示事件已被吸收
    fn apply(&mut self, event: TransportEvent) -> Result<Option<TransportEvent>, TransportError> {
        match event {
            TransportEvent::StateChanged(state) => {
                self.radio_state = state;
                if !state.is_usable() {
                    self.scanning = false;
                }
                Ok(Some(TransportEvent::StateChanged(state)))
            }

            TransportEvent::Discovered(peer) => {
                if self.scanning {
                    Ok(Some(TransportEvent::Discovered(peer)))
                } else {
                    trace!("Dropping late discovery of {}", peer.peer_id);
                    Ok(None)
                }
            }

            TransportEvent::Connected(peer) => {
                let Some(connection) = self.connection_for(&peer) else {
                    debug!("Ignoring connect event for untracked peer {peer}");
                    return Ok(None);
                };
                connection.state = TransportState::Connected;
                info!("Connected to {peer}");
                Ok(Some(TransportEvent::Connected(peer)))
            }

            TransportEvent::ServicesFound { peer, services } => {
                let service = self.service;
                let Some(connection) = self.connection_for(&peer) else {
                    return Ok(None);
                };
                if !services.contains(&service) {
                    return Err(TransportError::ServiceNotFound(service));
                }
                connection.state = TransportState::ServicesDiscovered;
                Ok(Some(TransportEvent::ServicesFound { peer, services }))
            }

            TransportEvent::CharacteristicsFound {
                peer,
                service,
                characteristics,
            } => {
                if service != self.service || self.connection_for(&peer).is_none() {
                    return Ok(None);
                }
                if !characteristics.contains(&self.characteristic) {
                    return Err(TransportError::CharacteristicNotFound(self.characteristic));
                }
                self.characteristics.extend(characteristics.iter().copied());
                if let Some(connection) = self.connection_for(&peer) {
                    connection.state = TransportState::Ready;
                }
                debug!("Link to {peer} ready");
                Ok(Some(TransportEvent::CharacteristicsFound {
                    peer,
                    service,
                    characteristics,
                }))
            }

            TransportEvent::ValueUpdated {
                peer,
                characteristic,
                value,
            } => {
                if self.connection_for(&peer).is_none()
                    || !self.characteristics.contains(&characteristic)
                {
                    trace!("Ignoring value from {peer} on {characteristic}");
                    return Ok(None);
                }
                let reassembler = self.reassemblers.entry(characteristic).or_default();
                match reassembler.push(&value)? {
                    Some(value) => Ok(Some(TransportEvent::ValueUpdated {
                        peer,
                        characteristic,
                        value,
                    })),
                    None => Ok(None),
                }
            }

            TransportEvent::Disconnected { peer, reason } => {
                if self.connection_for(&peer).is_none() {
                    debug!("Ignoring disconnect of untracked peer {peer}");
                    return Ok(None);
                }
                self.connection = None;
                self.clear_link();
                info!("Disconnected from {peer}");
                Ok(Some(TransportEvent::Disconnected { peer, reason }))
            }
        }
    }

    fn connection_for(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.connection.as_mut().filter(|c| &c.peer == peer)
    }

    fn connected_peer(&self) -> Result<PeerId, TransportError> {
        match &self.connection {
            Some(c) if c.state != TransportState::Connecting => Ok(c.peer.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn ready_peer(&self, characteristic: Uuid) -> Result<PeerId, TransportError> {
        match &self.connection {
            Some(c) if c.state == TransportState::Ready => {
                if self.characteristics.contains(&characteristic) {
                    Ok(c.peer.clone())
                } else {
                    Err(TransportError::CharacteristicNotFound(characteristic))
                }
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    fn clear_link(&mut self) {
        self.characteristics.clear();
        self.reassemblers.clear();
    }
}

struct ScanState<'a, R: CentralRadio> {
    transport: &'a mut BleTransport<R>,
    deadline: tokio::time::Instant,
    seen: HashMap<PeerId, (String, bool)>,
    started: bool,
    done: bool,
}
