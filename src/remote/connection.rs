//! 控制通道连接驱动
//!
//! 持有控制通道 socket 并驱动连接状态机：每次外部事件
//! （socket 建立、收到帧、出错、主动断开）进一次迁移表，
//! 通道内副作用（发握手帧、释放 socket）当场执行，
//! 跨层副作用（建流、通知渲染线程）原样交还给模块层。
//!
//! 地址解析失败是硬错误，直接让模块加载失败；
//! 连接被拒/握手失败不是——连接进 Failed 态，模块层据此善后。

use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use thiserror::Error;

use super::state::{connection_transition, ConnectionEvent, ConnectionState, Effect};
use super::wire::{Frame, WireError, ACK_OK};

/// 握手阶段的连接/读超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot resolve remote address: {0}")]
    Resolve(String),
}

/// TCP 控制通道
pub struct TcpConnection {
    addr: String,
    sink_name: String,
    app_name: String,
    socket: Option<TcpStream>,
    state: ConnectionState,
}

impl TcpConnection {
    pub fn new(addr: &str, sink_name: &str, app_name: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            sink_name: sink_name.to_owned(),
            app_name: app_name.to_owned(),
            socket: None,
            state: ConnectionState::Unconnected,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 控制 socket 的 fd（Ready 后供模块层监听挂断用）
    pub fn read_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// 阻塞式建连 + 握手，驱动状态机直到 Ready 或终态
    ///
    /// 返回留给模块层执行的副作用（CreateStream / PostConnectionLost）
    pub fn establish(&mut self) -> Result<Vec<Effect>, ConnectionError> {
        let sock_addr = self.resolve()?;

        self.state = ConnectionState::Connecting;
        log::info!("connecting to {}", self.addr);

        let socket = match TcpStream::connect_timeout(&sock_addr, HANDSHAKE_TIMEOUT) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("failed to connect to {}: {}", self.addr, e);
                return Ok(self.apply_event(ConnectionEvent::SocketError));
            }
        };
        if let Err(e) = socket
            .set_nodelay(true)
            .and_then(|_| socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT)))
        {
            log::error!("failed to set up control socket: {}", e);
            return Ok(self.apply_event(ConnectionEvent::SocketError));
        }
        self.socket = Some(socket);

        let mut out = self.apply_event(ConnectionEvent::SocketConnected);

        // 逐帧推进，直到 Ready 或掉进终态
        while self.state != ConnectionState::Ready && !self.state.is_terminal() {
            let event = self.read_event();
            out.extend(self.apply_event(event));
        }

        if self.state == ConnectionState::Ready {
            if let Some(socket) = &self.socket {
                if let Err(e) = socket
                    .set_read_timeout(None)
                    .and_then(|_| socket.set_nonblocking(true))
                {
                    log::error!("failed to switch control socket to non-blocking: {}", e);
                    out.extend(self.apply_event(ConnectionEvent::SocketError));
                    return Ok(out);
                }
            }
            log::info!("connection to {} is ready", self.addr);
        }
        Ok(out)
    }

    /// 控制 socket 可读时调用（非阻塞）
    ///
    /// Ready 之后服务端来帧一律意味着异常：挂断→SocketError，
    /// 多余 Ack 被迁移表忽略，其余帧按协议错误处理
    pub fn on_readable(&mut self) -> Vec<Effect> {
        let Some(socket) = self.socket.as_mut() else {
            return vec![];
        };
        match Frame::read_from(socket) {
            Ok(Frame::Ack { code }) if code == ACK_OK => {
                self.apply_event(ConnectionEvent::AckReceived)
            }
            Ok(frame) => {
                log::error!("unexpected frame on control channel: {:?}", frame);
                self.apply_event(ConnectionEvent::ProtocolError)
            }
            Err(WireError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => vec![],
            Err(WireError::Io(e)) => {
                log::info!("control channel closed by remote: {}", e);
                self.apply_event(ConnectionEvent::SocketError)
            }
            Err(e) => {
                log::error!("control channel protocol error: {}", e);
                self.apply_event(ConnectionEvent::ProtocolError)
            }
        }
    }

    /// 本端有序断开
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.apply_event(ConnectionEvent::Disconnect)
    }

    fn resolve(&self) -> Result<SocketAddr, ConnectionError> {
        self.addr
            .to_socket_addrs()
            .map_err(|_| ConnectionError::Resolve(self.addr.clone()))?
            .next()
            .ok_or_else(|| ConnectionError::Resolve(self.addr.clone()))
    }

    /// 把一个事件灌进迁移表并执行通道内副作用
    ///
    /// 发帧失败会追加一个 SocketError 事件，用队列消化掉，
    /// 避免在执行副作用的途中递归改状态
    fn apply_event(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let mut pending = VecDeque::from([event]);
        let mut out = Vec::new();

        while let Some(event) = pending.pop_front() {
            let (next, effects) = connection_transition(self.state, event);
            if next != self.state {
                log::debug!("connection state: {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                match effect {
                    Effect::SendHello => {
                        let frame = Frame::Hello {
                            version: super::wire::PROTOCOL_VERSION,
                            sink_name: self.sink_name.clone(),
                        };
                        if let Err(e) = self.send(frame) {
                            log::error!("failed to send hello: {}", e);
                            pending.push_back(ConnectionEvent::SocketError);
                        }
                    }
                    Effect::SendSetName => {
                        let frame = Frame::SetName {
                            app_name: self.app_name.clone(),
                        };
                        if let Err(e) = self.send(frame) {
                            log::error!("failed to send application name: {}", e);
                            pending.push_back(ConnectionEvent::SocketError);
                        }
                    }
                    Effect::ReleaseConnection => {
                        if let Some(socket) = self.socket.take() {
                            let _ = socket.shutdown(Shutdown::Both);
                        }
                    }
                    Effect::CreateStream | Effect::PostConnectionLost => out.push(effect),
                }
            }
        }
        out
    }

    fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        match self.socket.as_mut() {
            Some(socket) => frame.write_to(socket),
            None => Err(WireError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "control socket already released",
            ))),
        }
    }

    /// 握手期间阻塞读一帧并折算成状态机事件
    fn read_event(&mut self) -> ConnectionEvent {
        let Some(socket) = self.socket.as_mut() else {
            return ConnectionEvent::SocketError;
        };
        match Frame::read_from(socket) {
            Ok(Frame::Ack { code }) if code == ACK_OK => ConnectionEvent::AckReceived,
            Ok(Frame::Ack { code }) => {
                log::error!("remote refused handshake (code {})", code);
                ConnectionEvent::ProtocolError
            }
            Ok(frame) => {
                log::error!("unexpected handshake frame: {:?}", frame);
                ConnectionEvent::ProtocolError
            }
            Err(WireError::Io(e)) => {
                log::error!("control channel i/o error during handshake: {}", e);
                ConnectionEvent::SocketError
            }
            Err(e) => {
                log::error!("handshake protocol error: {}", e);
                ConnectionEvent::ProtocolError
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.socket.is_some() {
            let _ = self.disconnect();
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .finish()
    }
}
