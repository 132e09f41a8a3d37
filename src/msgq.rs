//! 跨线程消息队列
//!
//! 控制线程 ↔ 渲染线程各一条方向独立的 FIFO 队列：
//! - 队列内部 Mutex<VecDeque> + Condvar，消息量小，锁竞争可忽略
//! - 附带一条非阻塞唤醒管道（pipe2），读端可注册进 poll 多路复用
//! - 单方向内严格保序，两个方向之间不保证任何顺序
//!
//! 渲染线程在故障收尾阶段用 `recv_matching` 阻塞等待 Shutdown，
//! 期间到达的其他消息被丢弃（只推迟、不生效）。

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};

/// 非阻塞唤醒管道
///
/// 写端 notify 一个字节，读端注册进 poll；读端由消费方在被唤醒后 drain
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// 写入一个唤醒字节；管道已满说明唤醒尚未被消费，可安全忽略
    pub fn notify(&self) {
        let byte = 1u8;
        let ret = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("wake pipe write failed: {}", err);
            }
        }
    }

    /// 清空积累的唤醒字节
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret <= 0 {
                break;
            }
        }
    }

    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
    pipe: WakePipe,
}

/// 发送端（可克隆，多生产者）
pub struct MsgSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MsgSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> MsgSender<T> {
    /// 入队并唤醒消费方
    pub fn post(&self, msg: T) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(msg);
        }
        self.shared.cond.notify_one();
        self.shared.pipe.notify();
    }
}

/// 接收端（单消费者）
pub struct MsgReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MsgReceiver<T> {
    /// 非阻塞取一条消息
    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// 阻塞等待下一条消息
    pub fn recv(&self) -> T {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self.shared.cond.wait(queue).unwrap();
        }
    }

    /// 阻塞直到取到满足谓词的消息，途中的其他消息被丢弃
    ///
    /// 返回 (消息, 丢弃数)
    pub fn recv_matching<F: Fn(&T) -> bool>(&self, pred: F) -> (T, usize) {
        let mut discarded = 0usize;
        loop {
            let msg = self.recv();
            if pred(&msg) {
                return (msg, discarded);
            }
            discarded += 1;
        }
    }

    /// 唤醒管道读端，用于注册进 poll
    #[inline]
    pub fn wake_fd(&self) -> RawFd {
        self.shared.pipe.read_fd()
    }

    /// poll 报告可读之后清空唤醒管道
    pub fn drain_wake(&self) {
        self.shared.pipe.drain();
    }
}

/// 创建一条单向队列
pub fn channel<T>() -> io::Result<(MsgSender<T>, MsgReceiver<T>)> {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        cond: Condvar::new(),
        pipe: WakePipe::new()?,
    });
    Ok((
        MsgSender {
            shared: Arc::clone(&shared),
        },
        MsgReceiver { shared },
    ))
}
