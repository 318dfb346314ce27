//! 子命令实现

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use templock_core::store::SecretStore;
use templock_core::{
    AppSettings, BluerPeripheral, BtleplugCentral, FileService, FileState, HandshakeState,
    Initiator, InitiatorOptions, RelayClient, ResponderOptions, RoleController, Session, SessionEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// 创建会话并作为 Responder 广播，直到 Ctrl-C
pub async fn host(
    settings: &AppSettings,
    store: &dyn SecretStore,
    session_code: Option<String>,
    uploads: &[PathBuf],
) -> Result<()> {
    let relay = RelayClient::new(&settings.relay_url)?;
    let session = match session_code {
        // 同一房间码保留已保存的密钥，否则已上传的文件无法解密
        Some(code) => match Session::load(store)? {
            Some(saved) if saved.session_id() == code => saved,
            _ => Session::generate(code)?,
        },
        None => Session::generate(relay.create_session().await?)?,
    };
    session.save(store)?;

    println!("🔑 房间码: {}", session.session_id());

    if !uploads.is_empty() {
        let files = FileService::new(relay, session.clone());
        for path in uploads {
            upload_one(&files, path).await?;
        }
    }

    let mut controller: RoleController<BtleplugCentral, BluerPeripheral> = RoleController::new();
    let radio = BluerPeripheral::new().await?;
    controller
        .become_responder(radio, session, ResponderOptions::from(settings))
        .await?;
    println!("📡 正在广播 '{}'，等待对端输入房间码 (Ctrl-C 退出)", settings.device_name);

    loop {
        let event = tokio::select! {
            event = controller.next_event() => event?,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            SessionEvent::Connected(peer) => println!("🔗 {peer} 已订阅"),
            SessionEvent::PeerAuthenticated(peer) => println!("✅ {peer} 已加入会话"),
            SessionEvent::PeerRejected(peer) => println!("❌ {peer} 输入了错误的房间码"),
            SessionEvent::Disconnected { peer, .. } => println!("👋 {peer} 已断开"),
            SessionEvent::RadioUnavailable(state) => {
                controller.teardown().await;
                bail!("蓝牙不可用: {state}");
            }
            other => tracing::debug!("Unhandled event: {other:?}"),
        }
    }

    controller.teardown().await;
    println!("⏹️  已停止广播");
    Ok(())
}

/// 扫描、连接并用房间码换取会话密钥
pub async fn join(
    settings: &AppSettings,
    store: &dyn SecretStore,
    code: Option<String>,
) -> Result<()> {
    let interactive = code.is_none();
    let radio = BtleplugCentral::new().await?;
    let mut initiator = Initiator::new(radio, InitiatorOptions::from(settings))?;
    if let Some(code) = code {
        initiator = initiator.with_room_code(code);
    }

    println!("🔍 扫描附近设备 ({}s)...", settings.scan_timeout_secs);
    let peer = initiator.find_and_connect().await?;
    println!("   找到 {} ({})", peer.local_name, peer.peer_id);

    let result = loop {
        match initiator.next_event().await? {
            SessionEvent::Connected(peer) => println!("🔗 已连接 {peer}"),
            SessionEvent::Ready(_) => {
                if interactive && initiator.state() != HandshakeState::Authenticating {
                    initiator.begin(prompt_room_code().await?).await?;
                }
            }
            SessionEvent::KeyExchanged(session) => {
                session.save(store)?;
                println!("✅ 已加入会话 {}", session.session_id());
                break Ok(());
            }
            SessionEvent::AuthenticationFailed(_) => {
                println!("❌ 房间码错误");
                if !interactive {
                    break Err(anyhow::anyhow!("房间码被拒绝"));
                }
                initiator.begin(prompt_room_code().await?).await?;
            }
            SessionEvent::Reconnecting(peer) => println!("🔄 连接中断，正在重连 {peer}"),
            SessionEvent::Disconnected { peer, reason } => {
                break Err(anyhow::anyhow!(
                    "{peer} 已断开: {}",
                    reason.as_deref().unwrap_or("unknown")
                ));
            }
            SessionEvent::RadioUnavailable(state) => {
                break Err(anyhow::anyhow!("蓝牙不可用: {state}"));
            }
            SessionEvent::Failed(e) => return Err(e.into()),
            other => tracing::debug!("Unhandled event: {other:?}"),
        }
    };

    if let Err(e) = initiator.disconnect().await {
        tracing::warn!("Disconnect failed: {e}");
    }
    result?;

    list(settings, store).await
}

async fn prompt_room_code() -> Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("请输入房间码: ");
        std::io::stdout().flush()?;
        let line = lines.next_line().await?.context("标准输入已关闭")?;
        let code = line.trim();
        if !code.is_empty() {
            return Ok(code.to_string());
        }
    }
}

fn file_service(settings: &AppSettings, store: &dyn SecretStore) -> Result<FileService> {
    let session = Session::load(store)?
        .context("没有保存的会话，请先运行 `templock host` 或 `templock join`")?;
    Ok(FileService::new(RelayClient::new(&settings.relay_url)?, session))
}

pub async fn upload(settings: &AppSettings, store: &dyn SecretStore, path: &Path) -> Result<()> {
    upload_one(&file_service(settings, store)?, path).await
}

async fn upload_one(files: &FileService, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("无效的文件名: {}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("无法读取 {}", path.display()))?;

    println!("📤 上传 {name} ({} 字节)", bytes.len());
    let id = files.upload(name, &bytes).await?;
    println!("   文件 ID: {id}");
    Ok(())
}

pub async fn list(settings: &AppSettings, store: &dyn SecretStore) -> Result<()> {
    let files = file_service(settings, store)?;
    files.refresh().await?;

    let records = files.snapshot().await;
    if records.is_empty() {
        println!("   会话 {} 中没有文件", files.session().session_id());
        return Ok(());
    }
    for record in records {
        let marker = match record.state() {
            FileState::Downloaded => "✔",
            FileState::Downloading => "…",
            FileState::Inactive => " ",
        };
        println!(
            "{marker} {}  {}  {} 字节  {}",
            record.id,
            record.metadata.file_name,
            record.metadata.file_size,
            record.metadata.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn download(
    settings: &AppSettings,
    store: &dyn SecretStore,
    id: &str,
    dir: &Path,
) -> Result<()> {
    let files = file_service(settings, store)?;
    files.refresh().await?;

    let name = {
        let catalog = files.catalog();
        let catalog = catalog.lock().await;
        let record = catalog.get(id).with_context(|| format!("会话中没有文件 {id}"))?;
        // 只取最后一段，避免写出下载目录
        Path::new(&record.metadata.file_name)
            .file_name()
            .map_or_else(|| id.to_string(), |n| n.to_string_lossy().into_owned())
    };

    println!("📥 下载 {name}");
    let Some(bytes) = files.download(id).await? else {
        println!("   {name} 正在下载中");
        return Ok(());
    };

    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(&name);
    tokio::fs::write(&target, &bytes).await?;
    println!("   已保存到 {}", target.display());
    Ok(())
}

pub async fn delete(settings: &AppSettings, store: &dyn SecretStore, id: &str) -> Result<()> {
    let files = file_service(settings, store)?;
    files.delete(id).await?;
    println!("🗑️  已删除 {id}");
    Ok(())
}

pub async fn logs(settings: &AppSettings, store: &dyn SecretStore) -> Result<()> {
    let files = file_service(settings, store)?;
    println!("{}", files.logs().await?);
    Ok(())
}

pub fn forget(store: &dyn SecretStore) -> Result<()> {
    Session::forget(store)?;
    println!("🧹 已删除本地会话");
    Ok(())
}
