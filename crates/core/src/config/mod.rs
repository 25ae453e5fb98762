//! 应用配置
//!
//! 加载顺序：默认值 → TOML 配置文件 → 环境变量（前缀 `BOTS`，分隔符 `__`，
//! 例如 `BOTS__DISPATCHER__MAX_TASK_TIME_SECONDS=120`）。为兼容旧部署，
//! `WORKER_PORT` 会覆盖 RPC 监听端口。

pub mod models;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use models::*;

const DEFAULT_PATHS: [&str; 3] = [
    "config/bots.toml",
    "bots.toml",
    "/etc/analysis-bots/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub rpc: RpcConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("BOTS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let worker_port = std::env::var("WORKER_PORT")
            .ok()
            .map(|port| format!("0.0.0.0:{port}"));
        builder = builder
            .set_override_option("rpc.bind_address", worker_port)
            .context("设置WORKER_PORT覆盖失败")?;

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.dispatcher.validate()?;
        self.rpc.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
