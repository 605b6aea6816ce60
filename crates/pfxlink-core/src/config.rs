//! 应用配置和持久化
//!
//! 默认设备地址、扫描超时、写重试延迟等设置的存储和读取。
//! 配置文件位于 `<config_dir>/pfxlink/settings.toml`。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 默认连接的设备地址
    pub default_address: Option<String>,
    /// 查找外设时的扫描超时（秒）
    pub scan_timeout_secs: u64,
    /// 被拒绝的写请求的重试延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 按住遥控器按键时的重复间隔（毫秒）
    pub repeat_interval_ms: u64,
    /// 服务发现后自动查询设备信息
    pub auto_query: bool,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_address: None,
            scan_timeout_secs: 10,
            retry_delay_ms: 200,
            repeat_interval_ms: 200,
            auto_query: true,
            verbose: false,
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pfxlink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms)
    }
}
