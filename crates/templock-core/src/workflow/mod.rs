//! 工作流模块
//!
//! 提供高层 API 封装完整的角色流程:
//! - [`Initiator`]: 扫描、连接、输入房间码、获取会话密钥
//! - [`Responder`]: 广播、校验房间码、下发会话密钥
//! - [`RoleController`]: 同一时刻只持有一个角色，切换前完整拆除旧角色
//! - [`FileService`]: 基于会话的上传/列表/下载/删除

pub mod files;
pub mod initiator;
pub mod responder;

pub use files::FileService;
pub use initiator::{Initiator, InitiatorOptions};
pub use responder::{Responder, ResponderOptions};

use log::{info, warn};

use crate::ble::{CentralRadio, PeerId, PeripheralRadio, RadioState};
use crate::error::{Error, Result};
use crate::session::Session;

/// 会话层事件
#[derive(Debug)]
pub enum SessionEvent {
    /// 链路已建立（Responder 侧为对端订阅）
    Connected(PeerId),
    /// 认证特征可用，可以输入房间码
    Ready(PeerId),
    KeyExchanged(Session),
    AuthenticationFailed(PeerId),
    /// Responder 接受了对端的房间码
    PeerAuthenticated(PeerId),
    PeerRejected(PeerId),
    Reconnecting(PeerId),
    Disconnected {
        peer: PeerId,
        reason: Option<String>,
    },
    RadioUnavailable(RadioState),
    /// 连接级故障，连接已被拆除
    Failed(Error),
}

/// 意外断开后的重连策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    auto_reconnect: bool,
    tracked: Option<PeerId>,
}

impl ReconnectPolicy {
    /// `enabled = false` 时从不重连
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            auto_reconnect: false,
            tracked: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.auto_reconnect
    }

    pub fn tracked_peer(&self) -> Option<&PeerId> {
        self.tracked.as_ref()
    }

    /// 每次连接成功都重新开启
    pub fn on_connected(&mut self, peer: &PeerId) {
        self.tracked = Some(peer.clone());
        self.auto_reconnect = self.enabled;
    }

    /// 返回需要重连的对端
    pub fn on_unexpected_disconnect(&mut self, peer: &PeerId) -> Option<PeerId> {
        if self.auto_reconnect && self.tracked.as_ref() == Some(peer) {
            return Some(peer.clone());
        }
        self.disarm();
        None
    }

    /// 主动断开前调用
    pub fn disarm(&mut self) {
        self.auto_reconnect = false;
        self.tracked = None;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

pub enum Role<C: CentralRadio, P: PeripheralRadio> {
    Initiator(Initiator<C>),
    Responder(Responder<P>),
}

impl<C: CentralRadio, P: PeripheralRadio> Role<C, P> {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Initiator(_) => "initiator",
            Role::Responder(_) => "responder",
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Role::Initiator(i) => i.session(),
            Role::Responder(r) => Some(r.session()),
        }
    }
}

/// 角色控制器
pub struct RoleController<C: CentralRadio, P: PeripheralRadio> {
    active: Option<Role<C, P>>,
}

impl<C: CentralRadio, P: PeripheralRadio> Default for RoleController<C, P> {
    fn default() -> Self {
        Self { active: None }
    }
}

impl<C: CentralRadio, P: PeripheralRadio> RoleController<C, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&Role<C, P>> {
        self.active.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().and_then(Role::session)
    }

    pub fn initiator_mut(&mut self) -> Option<&mut Initiator<C>> {
        match self.active.as_mut() {
            Some(Role::Initiator(i)) => Some(i),
            _ => None,
        }
    }

    pub fn responder_mut(&mut self) -> Option<&mut Responder<P>> {
        match self.active.as_mut() {
            Some(Role::Responder(r)) => Some(r),
            _ => None,
        }
    }

    /// 拆除当前角色后成为 Initiator
    pub async fn become_initiator(&mut self, radio: C, options: InitiatorOptions) -> Result<()> {
        self.teardown().await;
        self.active = Some(Role::Initiator(Initiator::new(radio, options)?));
        info!("Switched to initiator role");
        Ok(())
    }

    /// 拆除当前角色后成为 Responder 并开始广播
    pub async fn become_responder(
        &mut self,
        radio: P,
        session: Session,
        options: ResponderOptions,
    ) -> Result<()> {
        self.teardown().await;
        let mut responder = Responder::new(radio, session, options)?;
        responder.start().await?;
        self.active = Some(Role::Responder(responder));
        info!("Switched to responder role");
        Ok(())
    }

    /// 拆除当前角色；拆除失败只记录，角色仍被丢弃
    pub async fn teardown(&mut self) {
        let Some(role) = self.active.take() else {
            return;
        };
        let name = role.name();
        let result = match role {
            Role::Initiator(mut i) => i.disconnect().await,
            Role::Responder(mut r) => r.stop().await,
        };
        if let Err(e) = result {
            warn!("Error tearing down {name} role: {e}");
        }
    }

    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        match self.active.as_mut() {
            Some(Role::Initiator(i)) => i.next_event().await,
            Some(Role::Responder(r)) => r.next_event().await,
            None => Err(Error::NoActiveRole),
        }
    }
}
