//! 数据通道流
//!
//! 远端客户端契约的数据面：cork/uncork、非阻塞可写量查询、
//! 相对追加写、延迟查询。
//!
//! "auto" 缓冲属性的落地：目标缓冲 250ms、最小请求 25ms（按采样规格换算
//! 成字节），用单调时钟令牌桶做发送节拍——可写量同时受令牌桶与内核
//! 发送缓冲余量约束，远端消费不动时 writable 归零，背压一路传导回
//! 渲染循环（不渲染、不写出）。
//!
//! 延迟口径：内核发送队列滞留字节（SIOCOUTQ）按采样规格换算成时长，
//! 即传输侧单向延迟的下界估计。

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::state::{stream_transition, StreamEvent, StreamState};
use super::wire::{Frame, WireError, ACK_OK};
use crate::format::SampleSpec;
use crate::stats::RelayStats;

/// "auto" 缓冲属性：目标缓冲时长
pub const DEFAULT_TARGET_LENGTH: Duration = Duration::from_millis(250);

/// "auto" 缓冲属性：最小请求时长
pub const DEFAULT_MIN_REQUEST: Duration = Duration::from_millis(25);

/// 握手阶段的读超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("stream handshake error: {0}")]
    Wire(#[from] WireError),
    #[error("remote rejected stream (code {0})")]
    Rejected(u8),
    #[error("cannot resolve remote address: {0}")]
    Resolve(String),
}

/// 远端流契约（客户端库的数据通道接口）
pub trait RemoteStream: Send {
    fn state(&self) -> StreamState;
    fn is_corked(&self) -> bool;
    /// Corked → Running；解除 cork 的那一轮迭代不发数据
    fn uncork(&mut self);
    /// 当前可写字节数（帧对齐；0 = 背压）
    fn writable_size(&mut self) -> usize;
    /// writable 为 0 时距下次可写的时间；None 表示受 socket 约束，
    /// 应改为监听 socket 可写事件
    fn time_to_writable(&self) -> Option<Duration>;
    /// 相对追加写；返回实际写出字节数
    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError>;
    /// (传输侧延迟, 是否为负)；无法测得时返回 None
    fn latency(&mut self) -> Option<(Duration, bool)>;
    fn data_fd(&self) -> Option<RawFd>;
    /// 本端有序断开（状态进入 Terminated）
    fn disconnect(&mut self);
}

/// TCP 数据通道流实现
pub struct TcpRemoteStream {
    socket: TcpStream,
    state: StreamState,
    spec: SampleSpec,
    target_length: usize,
    min_request: usize,
    budget: usize,
    last_refill: Instant,
    stats: Arc<RelayStats>,
}

impl TcpRemoteStream {
    /// 建立数据通道：连接、发 StreamHello、等 Ack，随后转入非阻塞模式
    ///
    /// 成功返回的流处于 Corked 起始态
    pub fn connect(
        addr: &str,
        spec: SampleSpec,
        stats: Arc<RelayStats>,
    ) -> Result<Self, StreamError> {
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|_| StreamError::Resolve(addr.to_owned()))?
            .next()
            .ok_or_else(|| StreamError::Resolve(addr.to_owned()))?;

        let mut socket = TcpStream::connect_timeout(&sock_addr, HANDSHAKE_TIMEOUT)?;
        socket.set_nodelay(true)?;
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        Frame::StreamHello {
            rate: spec.rate,
            channels: spec.channels,
            format: spec.format.wire_code(),
        }
        .write_to(&mut socket)?;

        match Frame::read_from(&mut socket)? {
            Frame::Ack { code } if code == ACK_OK => {}
            Frame::Ack { code } => return Err(StreamError::Rejected(code)),
            _ => {
                return Err(StreamError::Wire(WireError::BadPayload(
                    "expected ack after stream hello",
                )))
            }
        }

        socket.set_nonblocking(true)?;

        let target_length = spec.duration_to_bytes(DEFAULT_TARGET_LENGTH).max(spec.frame_size());
        let min_request = spec.duration_to_bytes(DEFAULT_MIN_REQUEST).max(spec.frame_size());

        log::debug!(
            "stream linked: target {} bytes, min request {} bytes",
            target_length,
            min_request
        );

        Ok(Self {
            socket,
            state: stream_transition(StreamState::Created, StreamEvent::Linked),
            spec,
            target_length,
            min_request,
            // 起始给满预算，解 cork 后允许一次突发填充远端缓冲
            budget: target_length,
            last_refill: Instant::now(),
            stats,
        })
    }

    fn apply(&mut self, event: StreamEvent) {
        let next = stream_transition(self.state, event);
        if next != self.state {
            log::debug!("stream state: {:?} -> {:?} ({:?})", self.state, next, event);
            self.state = next;
        }
    }

    /// 按实际流逝时间补充发送预算，封顶 target_length
    fn refill_budget(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let gained = self.spec.duration_to_bytes(elapsed);
        if gained > 0 {
            self.budget = (self.budget + gained).min(self.target_length);
            self.last_refill = now;
        }
    }

    /// 此时刻预算的投影值（不推进 last_refill）
    fn projected_budget(&self) -> usize {
        let elapsed = self.last_refill.elapsed();
        (self.budget + self.spec.duration_to_bytes(elapsed)).min(self.target_length)
    }

    /// 内核发送缓冲余量（SO_SNDBUF - 在队字节）
    fn socket_headroom(&self) -> usize {
        let fd = self.socket.as_raw_fd();

        let mut sndbuf: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &mut sndbuf as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 || sndbuf <= 0 {
            // 查询不到就只用令牌桶节拍
            return usize::MAX;
        }

        match Self::socket_outq(fd) {
            Some(outq) => (sndbuf as usize).saturating_sub(outq),
            None => usize::MAX,
        }
    }

    /// 内核发送队列滞留字节数
    #[cfg(target_os = "linux")]
    fn socket_outq(fd: RawFd) -> Option<usize> {
        let mut outq: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut outq) };
        if ret == 0 && outq >= 0 {
            Some(outq as usize)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn socket_outq(_fd: RawFd) -> Option<usize> {
        None
    }
}

impl RemoteStream for TcpRemoteStream {
    fn state(&self) -> StreamState {
        self.state
    }

    fn is_corked(&self) -> bool {
        self.state == StreamState::Corked
    }

    fn uncork(&mut self) {
        log::debug!("uncorking stream");
        self.apply(StreamEvent::Uncork);
        self.stats.note_uncork();
    }

    fn writable_size(&mut self) -> usize {
        if !self.state.is_good() {
            return 0;
        }
        self.refill_budget();
        if self.budget < self.min_request {
            return 0;
        }
        let writable = self.budget.min(self.socket_headroom());
        self.spec.align_down(writable)
    }

    fn time_to_writable(&self) -> Option<Duration> {
        let projected = self.projected_budget();
        let deficit = self.min_request.saturating_sub(projected);
        if deficit == 0 {
            // 预算充足，瓶颈在 socket，让 poll 监听可写事件
            return None;
        }
        let wait = self.spec.bytes_to_duration(deficit);
        Some(wait.max(Duration::from_millis(1)))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        match self.socket.write(data) {
            Ok(n) => {
                self.budget = self.budget.saturating_sub(n);
                self.stats.add_bytes_sent(n as u64);
                if n < data.len() {
                    // 可写量已按 sndbuf 余量裁剪，短写只会出现在查询竞态里
                    log::warn!("short write: {} of {} bytes, tail dropped", n, data.len());
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.stats.note_write_failure();
                self.apply(StreamEvent::WriteError);
                Err(StreamError::Io(e))
            }
        }
    }

    fn latency(&mut self) -> Option<(Duration, bool)> {
        if !self.state.is_good() {
            return None;
        }
        let outq = Self::socket_outq(self.socket.as_raw_fd())?;
        Some((self.spec.bytes_to_duration(outq), false))
    }

    fn data_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn disconnect(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
        self.apply(StreamEvent::Disconnect);
    }
}

impl Drop for TcpRemoteStream {
    fn drop(&mut self) {
        if self.state.is_good() {
            self.disconnect();
        }
    }
}
