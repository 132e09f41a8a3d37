//! 传输多路复用器（Transport Poller）
//!
//! 封装 poll(2)：同时等待
//! - 消息队列唤醒管道可读
//! - 另一个 fd（渲染线程注册数据通道 POLLOUT，控制线程注册控制通道 POLLIN）
//! - 可选超时（发送节拍由流的令牌桶给出）
//!
//! EINTR 自动重试；其余 poll 错误视为本 sink 实例不可恢复，
//! 由调用方走模块卸载的故障路径。

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpollError {
    #[error("poll failed: {0}")]
    Os(#[from] io::Error),
}

/// 对第二个 fd 关注的就绪方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// 一次 poll 的结果
#[derive(Clone, Copy, Debug, Default)]
pub struct PollOutcome {
    /// 超时返回（无 fd 就绪）
    pub timed_out: bool,
    /// 唤醒管道可读：有消息入队
    pub wake: bool,
    /// 第二个 fd 按关注方向就绪
    pub ready: bool,
    /// 第二个 fd 出错 / 对端挂断
    pub hangup: bool,
}

/// 包装唤醒管道 fd 的 poll 循环
pub struct Rtpoll {
    wake_fd: RawFd,
}

impl Rtpoll {
    pub fn new(wake_fd: RawFd) -> Self {
        Self { wake_fd }
    }

    /// 阻塞直到某个注册源就绪或超时
    pub fn wait(
        &self,
        other: Option<(RawFd, Interest)>,
        timeout: Option<Duration>,
    ) -> Result<PollOutcome, RtpollError> {
        let mut fds = [
            libc::pollfd {
                fd: self.wake_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            },
        ];
        let mut nfds: libc::nfds_t = 1;

        if let Some((fd, interest)) = other {
            fds[1].fd = fd;
            fds[1].events = match interest {
                Interest::Readable => libc::POLLIN,
                Interest::Writable => libc::POLLOUT,
            };
            nfds = 2;
        }

        // 上限约束到 i32 毫秒；None = 无限等待
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        loop {
            let n = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RtpollError::Os(err));
            }

            if n == 0 {
                return Ok(PollOutcome {
                    timed_out: true,
                    ..Default::default()
                });
            }

            let wake = fds[0].revents & libc::POLLIN != 0;
            let ready = fds[1].revents & (libc::POLLIN | libc::POLLOUT) != 0;
            let hangup =
                fds[1].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;

            return Ok(PollOutcome {
                timed_out: false,
                wake,
                ready,
                hangup,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgq::WakePipe;

    #[test]
    fn test_timeout() {
        let pipe = WakePipe::new().unwrap();
        let rtpoll = Rtpoll::new(pipe.read_fd());
        let outcome = rtpoll
            .wait(None, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.wake);
    }

    #[test]
    fn test_wake() {
        let pipe = WakePipe::new().unwrap();
        let rtpoll = Rtpoll::new(pipe.read_fd());
        pipe.notify();
        let outcome = rtpoll
            .wait(None, Some(Duration::from_millis(100)))
            .unwrap();
        assert!(outcome.wake);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_bad_fd_is_reported_on_other_slot() {
        // 对关闭的 fd poll 得到 POLLNVAL，映射为 hangup
        let pipe = WakePipe::new().unwrap();
        let rtpoll = Rtpoll::new(pipe.read_fd());
        let dead = {
            let tmp = WakePipe::new().unwrap();
            tmp.read_fd()
            // tmp 在此 drop，fd 已关闭
        };
        let outcome = rtpoll
            .wait(Some((dead, Interest::Writable)), Some(Duration::from_millis(100)))
            .unwrap();
        assert!(outcome.hangup);
    }
}
