//! Sink 门面与消息协议
//!
//! TunnelSink 是暴露给宿主音频服务器的注册对象：宿主侧的查询
//! （延迟、rewind、状态切换）全部经由消息队列转进渲染线程的世界，
//! 门面自身不触碰任何渲染线程状态。
//!
//! 消息协议的约定见 msgq 模块；核心只认识自己的消息码，
//! 其余一律原样转交宿主 sink 的通用处理器。

pub mod host;
pub mod worker;

use std::fmt;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::format::{ChannelMap, SampleSpec};
use crate::msgq::MsgSender;
use crate::remote::RemoteStream;

/// 宿主 sink 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl SinkState {
    /// 是否处于可渲染的工作状态
    #[inline]
    pub fn is_opened(self) -> bool {
        matches!(self, Self::Init | Self::Idle | Self::Running)
    }

    /// 是否已接入路由图（延迟查询只对 linked 的 sink 有意义）
    #[inline]
    pub fn is_linked(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Suspended)
    }
}

/// 控制线程 → 渲染线程
pub enum SinkMsg {
    /// 查询延迟；流不可达时必须回 0
    GetLatency { reply: mpsc::Sender<Duration> },
    /// 连接就绪：流句柄所有权随消息转移给渲染线程，
    /// 同时置位 connected 门控
    ConnectionEstablished { stream: Box<dyn RemoteStream> },
    /// 连接失效：清掉 connected 门控
    ConnectionLost,
    /// 宿主 sink 状态变更
    SetState(SinkState),
    /// 宿主要求 rewind
    RequestRewind,
    /// 核心不认识的消息码，转交宿主处理器
    Host(u32),
    /// 停渲染线程
    Shutdown,
}

impl fmt::Debug for SinkMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetLatency { .. } => "GetLatency",
            Self::ConnectionEstablished { .. } => "ConnectionEstablished",
            Self::ConnectionLost => "ConnectionLost",
            Self::SetState(_) => "SetState",
            Self::RequestRewind => "RequestRewind",
            Self::Host(_) => "Host",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// 渲染线程 → 控制线程
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreMsg {
    /// 渲染线程遇到不可恢复错误，请求卸载整个模块
    UnloadModule,
    /// 流句柄已释放（仅通告，不触发重建）
    StreamGone,
}

/// 暴露给宿主的注册对象
pub struct TunnelSink {
    name: String,
    spec: SampleSpec,
    map: ChannelMap,
    properties: Vec<(String, String)>,
    inq: MsgSender<SinkMsg>,
    thread: Option<JoinHandle<()>>,
}

impl TunnelSink {
    pub fn new(
        name: String,
        spec: SampleSpec,
        map: ChannelMap,
        properties: Vec<(String, String)>,
        inq: MsgSender<SinkMsg>,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            spec,
            map,
            properties,
            inq,
            thread: Some(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> SampleSpec {
        self.spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// 宿主的延迟查询：阻塞 RPC 到渲染线程
    ///
    /// 渲染线程没有可达的流时回 0；渲染线程无响应同样回 0
    pub fn get_latency(&self) -> Duration {
        let (tx, rx) = mpsc::channel();
        self.inq.post(SinkMsg::GetLatency { reply: tx });
        rx.recv_timeout(Duration::from_secs(1)).unwrap_or(Duration::ZERO)
    }

    pub fn set_state(&self, state: SinkState) {
        self.inq.post(SinkMsg::SetState(state));
    }

    /// 连接层交付流句柄（所有权随消息转移进渲染线程）
    pub fn connection_established(&self, stream: Box<dyn RemoteStream>) {
        self.inq.post(SinkMsg::ConnectionEstablished { stream });
    }

    /// 连接层通告连接失效
    pub fn connection_lost(&self) {
        self.inq.post(SinkMsg::ConnectionLost);
    }

    /// 宿主的 rewind 钩子
    pub fn request_rewind(&self) {
        self.inq.post(SinkMsg::RequestRewind);
    }

    /// 核心不认识的消息码走这里（强制委托路径）
    pub fn post_host_message(&self, code: u32) {
        self.inq.post(SinkMsg::Host(code));
    }

    /// 从路由图摘除
    pub fn unlink(&self) {
        self.set_state(SinkState::Unlinked);
    }

    /// 发 Shutdown 并等渲染线程退出
    pub fn shutdown_and_join(&mut self) {
        self.inq.post(SinkMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("render thread panicked");
            }
        }
    }
}

impl Drop for TunnelSink {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_state_predicates() {
        assert!(SinkState::Init.is_opened());
        assert!(SinkState::Idle.is_opened());
        assert!(SinkState::Running.is_opened());
        assert!(!SinkState::Suspended.is_opened());
        assert!(!SinkState::Unlinked.is_opened());

        assert!(!SinkState::Init.is_linked());
        assert!(SinkState::Idle.is_linked());
        assert!(SinkState::Running.is_linked());
        assert!(SinkState::Suspended.is_linked());
        assert!(!SinkState::Unlinked.is_linked());
    }
}
