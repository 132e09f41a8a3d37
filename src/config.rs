//! 模块加载参数
//!
//! 校验集中在 validate：地址非空、采样规格合法、声道映射与规格一致。
//! 重连策略默认关闭——断开后模块停留在失效状态直到卸载。

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::format::{ChannelMap, SampleSpec};

pub const DEFAULT_SINK_NAME: &str = "tunnel.remote";
pub const DEFAULT_APP_NAME: &str = "tunnel-sink";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server address must not be empty")]
    EmptyServer,
    #[error("invalid sample spec: {0}")]
    InvalidSpec(SampleSpec),
    #[error("channel map does not match sample spec")]
    ChannelMapMismatch,
    #[error("malformed property (expected key=value): {0}")]
    BadProperty(String),
    #[error("malformed reconnect policy (expected 'never' or seconds): {0}")]
    BadReconnect(String),
}

/// 连接失效后的重连策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// 不重连（默认）
    Never,
    /// 间隔给定时长后重试
    After(Duration),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Never
    }
}

impl FromStr for ReconnectPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("never") {
            return Ok(Self::Never);
        }
        match s.parse::<u64>() {
            Ok(0) => Ok(Self::Never),
            Ok(secs) => Ok(Self::After(Duration::from_secs(secs))),
            Err(_) => Err(ConfigError::BadReconnect(s.to_owned())),
        }
    }
}

/// sink 属性参数，key=value 形式
pub fn parse_property(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(ConfigError::BadProperty(s.to_owned())),
    }
}

#[derive(Clone, Debug)]
pub struct ModuleConfig {
    /// 远端服务器地址（host:port）
    pub server: String,
    pub sink_name: String,
    pub app_name: String,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub properties: Vec<(String, String)>,
    pub reconnect: ReconnectPolicy,
}

impl ModuleConfig {
    /// 只有 server 是必填项，其余取默认值
    pub fn new(server: &str) -> Self {
        let spec = SampleSpec::default();
        let map = ChannelMap::default_for(spec.channels);
        Self {
            server: server.to_owned(),
            sink_name: DEFAULT_SINK_NAME.to_owned(),
            app_name: DEFAULT_APP_NAME.to_owned(),
            spec,
            map,
            properties: Vec::new(),
            reconnect: ReconnectPolicy::Never,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if !self.spec.is_valid() {
            return Err(ConfigError::InvalidSpec(self.spec));
        }
        if !self.map.matches(&self.spec) {
            return Err(ConfigError::ChannelMapMismatch);
        }
        Ok(())
    }
}
