//! 应用配置和持久化
//!
//! 设置以 TOML 保存在 `<config_dir>/templock/settings.toml`，
//! 文件缺失或无法解析时使用默认值。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ble::{DEFAULT_LOCAL_NAME, DEFAULT_MTU};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 广播时使用的本地名称
    pub device_name: String,
    /// 中继服务器地址
    pub relay_url: String,
    /// 扫描超时（秒）
    pub scan_timeout_secs: u64,
    /// 单次写入/通知的载荷上限
    pub mtu: usize,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 意外断开后自动重连
    pub auto_reconnect: bool,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_LOCAL_NAME.to_string(),
            relay_url: "http://localhost:8000".to_string(),
            scan_timeout_secs: 30,
            mtu: DEFAULT_MTU,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_reconnect: true,
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("templock")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse settings: {e}, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read settings file: {e}, using defaults");
                Self::default()
            }
        }
    }

    /// 保存设置
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}
