//! 连接 / 流 生命周期状态机
//!
//! 状态迁移抽成纯函数 `(state, event) -> (state, effects)`，
//! 副作用（发握手帧、建流、向渲染线程发消息）由调用方执行，
//! 迁移表可以在没有真实连接的情况下单独测试。
//!
//! 语义约定：
//! - 过渡态（Connecting/Authorizing/SettingName）只产生日志
//! - Ready 恰好触发一次建流
//! - Failed/Terminated 释放句柄、通知渲染线程断开；不安排重试
//!   （重连策略属于模块层配置，默认关闭）
//! - 流挂掉而连接仍 Ready 时不会自动重建流，渲染循环只是停止写出

/// 控制通道连接状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl ConnectionState {
    /// 是否已经走到终态
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// 数据通道流状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Corked,
    Running,
    Failed,
    Terminated,
}

impl StreamState {
    /// 渲染循环的发送分支只接受 good 状态
    #[inline]
    pub fn is_good(self) -> bool {
        matches!(self, Self::Created | Self::Corked | Self::Running)
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// 连接驱动产生的事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// TCP 三次握手完成
    SocketConnected,
    /// 收到服务端确认帧（含义取决于当前阶段）
    AckReceived,
    /// 收到无法解析/不符合阶段的帧
    ProtocolError,
    /// socket 出错或对端挂断
    SocketError,
    /// 本端主动断开
    Disconnect,
}

/// 迁移产生的副作用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// 发送 Hello 帧
    SendHello,
    /// 发送 SetName 帧
    SendSetName,
    /// 创建数据通道流（随后由模块层把流的所有权交给渲染线程）
    CreateStream,
    /// 释放连接句柄
    ReleaseConnection,
    /// 通知渲染线程连接已失效（清 connected 标志）
    PostConnectionLost,
}

/// 连接状态迁移表
pub fn connection_transition(
    state: ConnectionState,
    event: ConnectionEvent,
) -> (ConnectionState, Vec<Effect>) {
    use ConnectionEvent::*;
    use ConnectionState::*;

    // 终态吸收一切事件
    if state.is_terminal() {
        return (state, vec![]);
    }

    match (state, event) {
        (Unconnected, SocketConnected) | (Connecting, SocketConnected) => {
            (Authorizing, vec![Effect::SendHello])
        }
        (Authorizing, AckReceived) => (SettingName, vec![Effect::SendSetName]),
        (SettingName, AckReceived) => (Ready, vec![Effect::CreateStream]),
        // Ready 之后的多余确认帧忽略
        (Ready, AckReceived) => (Ready, vec![]),

        (_, SocketError) | (_, ProtocolError) => (
            Failed,
            vec![Effect::ReleaseConnection, Effect::PostConnectionLost],
        ),
        (_, Disconnect) => (
            Terminated,
            vec![Effect::ReleaseConnection, Effect::PostConnectionLost],
        ),

        // 其余组合不改变状态
        (s, _) => (s, vec![]),
    }
}

/// 流驱动产生的事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// 数据通道握手完成，进入 corked 起始态
    Linked,
    /// 渲染循环解除 cork
    Uncork,
    /// 重新 cork
    Cork,
    /// 写出失败
    WriteError,
    /// socket 挂断
    Hangup,
    /// 本端主动断开
    Disconnect,
}

/// 流状态迁移表
pub fn stream_transition(state: StreamState, event: StreamEvent) -> StreamState {
    use StreamEvent::*;
    use StreamState::*;

    if state.is_terminal() {
        return state;
    }

    match (state, event) {
        (Created, Linked) => Corked,
        (Corked, Uncork) => Running,
        (Running, Cork) => Corked,
        (_, WriteError) => Failed,
        (_, Hangup) => Terminated,
        (_, Disconnect) => Terminated,
        (s, _) => s,
    }
}
