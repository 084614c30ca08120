//! 应用配置和持久化
//!
//! 提供广播名称、扫描过滤和演示负载的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::gatt::READ_CHAR_UUID;
use crate::peripheral::PeripheralConfig;

/// 默认广播名称，同时也是 central 的扫描过滤
pub const DEFAULT_LOCAL_NAME: &str = "Test Peripheral";

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 外设广播的本地名称
    pub local_name: String,
    /// central 扫描时匹配的本地名称
    pub scan_filter: String,
    /// 读特征的初始值
    pub read_value: String,
    /// central 写入的演示数据
    pub write_payload: String,
    pub notify_payload: String,
    pub indicate_payload: String,
    /// 事件/命令通道容量
    pub event_buffer: usize,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            scan_filter: DEFAULT_LOCAL_NAME.to_string(),
            read_value: "World".to_string(),
            write_payload: "Hello".to_string(),
            notify_payload: "Notify".to_string(),
            indicate_payload: "Indicate".to_string(),
            event_buffer: 64,
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluetest");
        config_dir.join("settings.toml")
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

    /// 外设引擎的配置
    pub fn peripheral_config(&self) -> PeripheralConfig {
        PeripheralConfig::new(self.local_name.clone())
            .with_value(READ_CHAR_UUID, self.read_value.as_bytes())
    }
}
