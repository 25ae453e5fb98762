use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// 任务存储配置
///
/// `url` 为 `memory` 时使用内存存储，否则按 sqlx 的 SQLite URL 解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:analysis-bots.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url == "memory"
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if !self.is_in_memory() && !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("不支持的数据库URL: {}", self.url));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        Ok(())
    }
}

/// 调度核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 单个任务的最长运行时间（秒）
    pub max_task_time_seconds: u64,
    /// 超时清扫的周期（秒），不能大于 `max_task_time_seconds`
    pub sweep_interval_seconds: u64,
    /// 没有活跃模板时定时器的占位间隔（秒）
    pub idle_timer_seconds: u64,
    /// 一批模板中有失败时，定时器最早的重试间隔（秒）
    pub failure_backoff_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_task_time_seconds: 60,
            sweep_interval_seconds: 10,
            idle_timer_seconds: 3600,
            failure_backoff_seconds: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_task_time_seconds == 0 {
            return Err(anyhow::anyhow!("任务最长运行时间必须大于0"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("超时清扫间隔必须大于0"));
        }
        if self.sweep_interval_seconds > self.max_task_time_seconds {
            return Err(anyhow::anyhow!(
                "超时清扫间隔({}秒)不能大于任务最长运行时间({}秒)",
                self.sweep_interval_seconds,
                self.max_task_time_seconds
            ));
        }
        if self.idle_timer_seconds == 0 {
            return Err(anyhow::anyhow!("定时器占位间隔必须大于0"));
        }
        if self.failure_backoff_seconds == 0 {
            return Err(anyhow::anyhow!("失败重试间隔必须大于0"));
        }
        Ok(())
    }
}

/// Worker RPC 监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub bind_address: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_address
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("RPC监听地址无效 '{}': {e}", self.bind_address))?;
        Ok(())
    }
}

/// 日志与指标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9091".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }
        if self.metrics_enabled {
            self.metrics_bind_address.parse::<SocketAddr>().map_err(|e| {
                anyhow::anyhow!("指标监听地址无效 '{}': {e}", self.metrics_bind_address)
            })?;
        }
        Ok(())
    }
}
