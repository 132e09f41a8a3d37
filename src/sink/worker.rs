//! 渲染工作线程（系统的功能核心）
//!
//! 独立 OS 线程上的协作式循环，每轮迭代：
//! 1. 排干 rewind 请求（0 字节，簿记在宿主侧）
//! 2. sink 处于工作状态时刷新单调时间戳
//! 3. 发送分支：connected && 流状态 good && sink opened 时——
//!    corked 先解 cork（该轮不发数据）；否则查可写量，
//!    为 0 就背压（不渲染不写出），>0 且无在途块时按可写量精确渲染，
//!    整块写出后无论成败立即释放块
//! 4. 阻塞在传输多路复用器上等下一个就绪事件
//!
//! poll 出错走故障路径：向控制线程请求卸载模块，然后丢弃一切
//! 消息只等 Shutdown，收到后退出线程。
//!
//! 渲染线程从不发起连接级操作；流句柄经 ConnectionEstablished
//! 消息转移所有权进来，connected 门控只由消息驱动——
//! 线程之间没有任何未同步的共享可变状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::host::RenderHost;
use super::{CoreMsg, SinkMsg, SinkState};
use crate::memchunk::MemChunk;
use crate::msgq::{MsgReceiver, MsgSender};
use crate::remote::RemoteStream;
use crate::rtpoll::{Interest, Rtpoll};
use crate::stats::RelayStats;

pub struct RenderWorker {
    inq: MsgReceiver<SinkMsg>,
    outq: MsgSender<CoreMsg>,
    rtpoll: Rtpoll,
    host: Box<dyn RenderHost>,
    state: SinkState,
    connected: bool,
    stream: Option<Box<dyn RemoteStream>>,
    chunk: MemChunk,
    rewind_requested: bool,
    timestamp: Instant,
    stats: Arc<RelayStats>,
    shutdown: bool,
}

impl RenderWorker {
    pub fn new(
        inq: MsgReceiver<SinkMsg>,
        outq: MsgSender<CoreMsg>,
        host: Box<dyn RenderHost>,
        stats: Arc<RelayStats>,
    ) -> Self {
        let rtpoll = Rtpoll::new(inq.wake_fd());
        Self {
            inq,
            outq,
            rtpoll,
            host,
            state: SinkState::Init,
            connected: false,
            stream: None,
            chunk: MemChunk::empty(),
            rewind_requested: false,
            timestamp: Instant::now(),
            stats,
            shutdown: false,
        }
    }

    /// 线程主函数
    pub fn run(&mut self) {
        log::debug!("tunnel-sink: render thread starting up");
        self.timestamp = Instant::now();

        loop {
            self.step_transmit();

            let (other, timeout) = self.poll_plan();
            match self.rtpoll.wait(other, timeout) {
                Err(e) => {
                    log::error!("tunnel-sink: poll failed: {}", e);
                    self.fail_and_drain();
                    return;
                }
                Ok(outcome) => {
                    if outcome.wake {
                        self.inq.drain_wake();
                        while let Some(msg) = self.inq.try_recv() {
                            self.dispatch(msg);
                            if self.shutdown {
                                break;
                            }
                        }
                    }
                    if outcome.hangup {
                        if let Some(stream) = self.stream.as_mut() {
                            log::info!("stream socket hangup");
                            stream.disconnect();
                        }
                    }
                    if self.shutdown {
                        break;
                    }
                }
            }
        }

        log::debug!("tunnel-sink: render thread shutting down");
    }

    /// 一轮迭代的发送分支
    fn step_transmit(&mut self) {
        if self.rewind_requested {
            self.rewind_requested = false;
            self.host.process_rewind(0);
        }

        if self.state.is_opened() {
            self.timestamp = Instant::now();
        }

        // Failed/Terminated 的流：释放句柄、清空槽位、通告控制线程。
        // 不做自动重建；connected 门控保持原值，只能被
        // ConnectionEstablished / ConnectionLost 消息改写。
        if matches!(&self.stream, Some(s) if !s.state().is_good()) {
            let state = self.stream.as_ref().map(|s| s.state());
            log::info!("releasing stream handle (state: {:?})", state);
            self.stream = None;
            self.outq.post(CoreMsg::StreamGone);
        }

        if !(self.connected && self.state.is_opened()) {
            return;
        }

        {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            if stream.is_corked() {
                // 传输就绪信号：解 cork 的迭代不发数据
                stream.uncork();
                return;
            }
        }

        let writable = match self.stream.as_mut() {
            Some(stream) => stream.writable_size(),
            None => return,
        };
        if writable == 0 {
            // 背压：远端没准备好，这一轮不渲染也不写出
            return;
        }

        if self.chunk.is_empty() {
            // 渲染量由远端可写量决定，不是固定块大小
            self.chunk = self.host.render(writable);
            self.stats.note_chunk_rendered();
        }
        if self.chunk.is_empty() {
            return;
        }

        let result = match self.stream.as_mut() {
            Some(stream) => stream.write(self.chunk.as_bytes()),
            None => {
                self.chunk.reset();
                return;
            }
        };

        // 无论写成与不成，块引用都在本轮迭代内释放
        self.chunk.reset();

        if let Err(e) = result {
            log::warn!("could not write data into the stream: {}", e);
        }
    }

    /// 决定下一次 poll 监听什么
    ///
    /// 发送分支不活跃时只等消息；节拍受限时用令牌桶给出的超时，
    /// socket 受限时监听数据通道可写事件
    fn poll_plan(&self) -> (Option<(std::os::unix::io::RawFd, Interest)>, Option<Duration>) {
        let stream = match &self.stream {
            Some(s) if self.connected && self.state.is_opened() && s.state().is_good() => s,
            _ => return (None, None),
        };

        if stream.is_corked() {
            // 下一轮立即解 cork
            return (None, Some(Duration::ZERO));
        }

        match stream.time_to_writable() {
            Some(wait) => (None, Some(wait)),
            None => match stream.data_fd() {
                Some(fd) => (Some((fd, Interest::Writable)), None),
                None => (None, Some(Duration::from_millis(1))),
            },
        }
    }

    /// 消息分发（poll 唤醒路径的一部分）
    fn dispatch(&mut self, msg: SinkMsg) {
        match msg {
            SinkMsg::GetLatency { reply } => {
                self.stats.note_latency_query();
                let _ = reply.send(self.query_latency());
            }
            SinkMsg::ConnectionEstablished { stream } => {
                log::debug!("connection established, stream handed to render thread");
                if self.stream.is_some() {
                    log::warn!("replacing live stream handle");
                }
                self.stream = Some(stream);
                self.connected = true;
            }
            SinkMsg::ConnectionLost => {
                log::debug!("connection lost, closing transmit gate");
                self.connected = false;
            }
            SinkMsg::SetState(state) => {
                log::debug!("sink state: {:?} -> {:?}", self.state, state);
                self.state = state;
            }
            SinkMsg::RequestRewind => {
                self.rewind_requested = true;
            }
            // 核心不认识的消息码：强制委托给宿主处理器
            SinkMsg::Host(code) => {
                self.host.handle_message(code);
            }
            SinkMsg::Shutdown => {
                self.shutdown = true;
            }
        }
    }

    /// GetLatency 语义：流已 link 且可达时回传输侧延迟，否则回 0
    fn query_latency(&mut self) -> Duration {
        if !self.state.is_linked() {
            return Duration::ZERO;
        }
        match self.stream.as_mut() {
            Some(stream) => match stream.latency() {
                Some((latency, _negative)) => latency,
                None => Duration::ZERO,
            },
            None => Duration::ZERO,
        }
    }

    /// poll 致命错误的故障路径：请求卸载模块，之后只认 Shutdown
    fn fail_and_drain(&mut self) {
        self.outq.post(CoreMsg::UnloadModule);
        let (_, discarded) = self
            .inq
            .recv_matching(|msg| matches!(msg, SinkMsg::Shutdown));
        if discarded > 0 {
            log::debug!("discarded {} messages while waiting for shutdown", discarded);
        }
        log::debug!("tunnel-sink: render thread shutting down (after poll failure)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memchunk::MemBlock;
    use crate::msgq;
    use crate::remote::{StreamError, StreamState};
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::sync::Mutex;

    /// 脚本化的流替身
    struct MockShared {
        state: StreamState,
        writable: VecDeque<usize>,
        writes: Vec<usize>,
        uncork_calls: usize,
        writable_calls: usize,
        latency: Option<(Duration, bool)>,
        fail_writes: bool,
    }

    struct MockStream {
        shared: Arc<Mutex<MockShared>>,
    }

    fn mock_stream(state: StreamState) -> (Box<dyn RemoteStream>, Arc<Mutex<MockShared>>) {
        let shared = Arc::new(Mutex::new(MockShared {
            state,
            writable: VecDeque::new(),
            writes: Vec::new(),
            uncork_calls: 0,
            writable_calls: 0,
            latency: None,
            fail_writes: false,
        }));
        (
            Box::new(MockStream {
                shared: Arc::clone(&shared),
            }),
            shared,
        )
    }

    impl RemoteStream for MockStream {
        fn state(&self) -> StreamState {
            self.shared.lock().unwrap().state
        }
        fn is_corked(&self) -> bool {
            self.shared.lock().unwrap().state == StreamState::Corked
        }
        fn uncork(&mut self) {
            let mut s = self.shared.lock().unwrap();
            s.uncork_calls += 1;
            s.state = StreamState::Running;
        }
        fn writable_size(&mut self) -> usize {
            let mut s = self.shared.lock().unwrap();
            s.writable_calls += 1;
            s.writable.pop_front().unwrap_or(0)
        }
        fn time_to_writable(&self) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
            let mut s = self.shared.lock().unwrap();
            if s.fail_writes {
                return Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock broken pipe",
                )));
            }
            s.writes.push(data.len());
            Ok(data.len())
        }
        fn latency(&mut self) -> Option<(Duration, bool)> {
            self.shared.lock().unwrap().latency
        }
        fn data_fd(&self) -> Option<std::os::unix::io::RawFd> {
            None
        }
        fn disconnect(&mut self) {
            self.shared.lock().unwrap().state = StreamState::Terminated;
        }
    }

    /// 计数的宿主替身
    struct HostShared {
        renders: Vec<usize>,
        rewinds: usize,
        messages: Vec<u32>,
    }

    struct MockHost {
        shared: Arc<Mutex<HostShared>>,
    }

    fn mock_host() -> (Box<dyn RenderHost>, Arc<Mutex<HostShared>>) {
        let shared = Arc::new(Mutex::new(HostShared {
            renders: Vec::new(),
            rewinds: 0,
            messages: Vec::new(),
        }));
        (
            Box::new(MockHost {
                shared: Arc::clone(&shared),
            }),
            shared,
        )
    }

    impl RenderHost for MockHost {
        fn render(&mut self, nbytes: usize) -> MemChunk {
            self.shared.lock().unwrap().renders.push(nbytes);
            MemChunk::from_block(MemBlock::new(vec![0xAB; nbytes]))
        }
        fn process_rewind(&mut self, _nbytes: usize) {
            self.shared.lock().unwrap().rewinds += 1;
        }
        fn handle_message(&mut self, code: u32) {
            self.shared.lock().unwrap().messages.push(code);
        }
    }

    struct Fixture {
        worker: RenderWorker,
        inq_tx: msgq::MsgSender<SinkMsg>,
        outq_rx: msgq::MsgReceiver<CoreMsg>,
        host: Arc<Mutex<HostShared>>,
    }

    fn fixture() -> Fixture {
        let (inq_tx, inq_rx) = msgq::channel().unwrap();
        let (outq_tx, outq_rx) = msgq::channel().unwrap();
        let (host, host_shared) = mock_host();
        let worker = RenderWorker::new(inq_rx, outq_tx, host, Arc::new(RelayStats::new()));
        Fixture {
            worker,
            inq_tx,
            outq_rx,
            host: host_shared,
        }
    }

    #[test]
    fn test_at_most_one_cell() {
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        f.worker.stream = Some(stream);
        f.worker.connected = true;
        f.worker.state = SinkState::Running;
        shared.lock().unwrap().writable.push_back(4096);

        // 已有在途块时绝不触发第二次渲染
        f.worker.chunk = MemChunk::from_block(MemBlock::new(vec![0xCD; 128]));
        f.worker.step_transmit();

        assert!(f.host.lock().unwrap().renders.is_empty(), "render must not run while a cell is held");
        // 写出的是已持有的块
        assert_eq!(shared.lock().unwrap().writes, vec![128]);
        assert!(f.worker.chunk.is_empty());
    }

    #[test]
    fn test_backpressure_no_render_on_zero_writable() {
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        f.worker.stream = Some(stream);
        f.worker.connected = true;
        f.worker.state = SinkState::Running;

        // writable 序列 [0, 0, 4096]：渲染次数 ≤ 容量为正的迭代数
        shared.lock().unwrap().writable.extend([0, 0, 4096]);
        for _ in 0..3 {
            f.worker.step_transmit();
        }

        let renders = &f.host.lock().unwrap().renders;
        assert_eq!(renders.len(), 1);
        assert_eq!(renders[0], 4096);
        assert_eq!(shared.lock().unwrap().writes, vec![4096]);
    }

    #[test]
    fn test_write_then_release_on_success_and_failure() {
        // 成功路径
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        f.worker.stream = Some(stream);
        f.worker.connected = true;
        f.worker.state = SinkState::Running;
        shared.lock().unwrap().writable.push_back(256);

        let block = MemBlock::new(vec![0u8; 256]);
        let probe = block.clone();
        f.worker.chunk = MemChunk::from_block(block);
        f.worker.step_transmit();
        assert!(f.worker.chunk.is_empty());
        assert_eq!(probe.ref_count(), 1, "block reference must be released");

        // 失败路径同样释放
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        f.worker.stream = Some(stream);
        f.worker.connected = true;
        f.worker.state = SinkState::Running;
        {
            let mut s = shared.lock().unwrap();
            s.writable.push_back(256);
            s.fail_writes = true;
        }

        let block = MemBlock::new(vec![0u8; 256]);
        let probe = block.clone();
        f.worker.chunk = MemChunk::from_block(block);
        f.worker.step_transmit();
        assert!(f.worker.chunk.is_empty());
        assert_eq!(probe.ref_count(), 1, "block reference must be released on write failure");
    }

    #[test]
    fn test_state_gate_table() {
        // connected × 流状态 × sink 状态 全组合：
        // 发送分支执行 ⟺ connected && 流 good && sink opened
        let stream_states = [
            StreamState::Corked,
            StreamState::Running,
            StreamState::Failed,
            StreamState::Terminated,
        ];
        let sink_states = [SinkState::Running, SinkState::Suspended];

        for connected in [true, false] {
            for stream_state in stream_states {
                for sink_state in sink_states {
                    let mut f = fixture();
                    let (stream, shared) = mock_stream(stream_state);
                    f.worker.stream = Some(stream);
                    f.worker.connected = connected;
                    f.worker.state = sink_state;
                    shared.lock().unwrap().writable.push_back(4096);

                    f.worker.step_transmit();

                    let s = shared.lock().unwrap();
                    let executed = s.uncork_calls > 0 || s.writable_calls > 0;
                    let expected =
                        connected && stream_state.is_good() && sink_state.is_opened();
                    assert_eq!(
                        executed, expected,
                        "gate mismatch: connected={} stream={:?} sink={:?}",
                        connected, stream_state, sink_state
                    );

                    // 非 good 的流无论门控如何都被释放
                    if !stream_state.is_good() {
                        assert!(f.worker.stream.is_none());
                        assert_eq!(f.outq_rx.try_recv(), Some(CoreMsg::StreamGone));
                    }
                }
            }
        }
    }

    #[test]
    fn test_uncork_iteration_sends_nothing() {
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Corked);
        f.worker.stream = Some(stream);
        f.worker.connected = true;
        f.worker.state = SinkState::Running;
        shared.lock().unwrap().writable.push_back(4096);

        f.worker.step_transmit();

        let s = shared.lock().unwrap();
        assert_eq!(s.uncork_calls, 1);
        assert_eq!(s.state, StreamState::Running);
        assert!(s.writes.is_empty(), "uncork iteration must not write");
        assert!(f.host.lock().unwrap().renders.is_empty());
    }

    #[test]
    fn test_shutdown_draining_after_poll_failure() {
        let mut f = fixture();
        // 故障期间先到一条宿主消息、再到 Shutdown：
        // 宿主消息必须被丢弃，线程只对 Shutdown 起反应
        f.inq_tx.post(SinkMsg::Host(42));
        f.inq_tx.post(SinkMsg::Shutdown);

        f.worker.fail_and_drain();

        assert_eq!(f.outq_rx.try_recv(), Some(CoreMsg::UnloadModule));
        assert!(
            f.host.lock().unwrap().messages.is_empty(),
            "messages arriving during teardown must be deferred, not acted on"
        );
    }

    #[test]
    fn test_latency_fallback() {
        // 无流 → 0
        let mut f = fixture();
        f.worker.state = SinkState::Running;
        assert_eq!(f.worker.query_latency(), Duration::ZERO);

        // 有流但连 link 都没有（Init）→ 0
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        shared.lock().unwrap().latency = Some((Duration::from_millis(30), false));
        f.worker.stream = Some(stream);
        f.worker.state = SinkState::Init;
        assert_eq!(f.worker.query_latency(), Duration::ZERO);

        // 流可达 → 原样回传
        let mut f = fixture();
        let (stream, shared) = mock_stream(StreamState::Running);
        shared.lock().unwrap().latency = Some((Duration::from_millis(30), false));
        f.worker.stream = Some(stream);
        f.worker.state = SinkState::Running;
        assert_eq!(f.worker.query_latency(), Duration::from_millis(30));

        // 流回 None（不可达）→ 0
        let mut f = fixture();
        let (stream, _shared) = mock_stream(StreamState::Running);
        f.worker.stream = Some(stream);
        f.worker.state = SinkState::Running;
        assert_eq!(f.worker.query_latency(), Duration::ZERO);
    }

    #[test]
    fn test_get_latency_message_replies() {
        let mut f = fixture();
        f.worker.state = SinkState::Running;
        let (tx, rx) = mpsc::channel();
        f.worker.dispatch(SinkMsg::GetLatency { reply: tx });
        assert_eq!(rx.recv().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_codes_are_delegated() {
        let mut f = fixture();
        f.worker.dispatch(SinkMsg::Host(7));
        f.worker.dispatch(SinkMsg::Host(9));
        assert_eq!(f.host.lock().unwrap().messages, vec![7, 9]);
    }

    #[test]
    fn test_rewind_drained_with_zero_bytes() {
        let mut f = fixture();
        f.worker.dispatch(SinkMsg::RequestRewind);
        f.worker.step_transmit();
        assert_eq!(f.host.lock().unwrap().rewinds, 1);
        // 请求已排干，不重复处理
        f.worker.step_transmit();
        assert_eq!(f.host.lock().unwrap().rewinds, 1);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut f = fixture();
        f.worker.state = SinkState::Running;

        // 连接就绪：流以 corked 状态转移进来，connected 置位
        let (stream, shared) = mock_stream(StreamState::Corked);
        f.worker.dispatch(SinkMsg::ConnectionEstablished { stream });
        assert!(f.worker.connected);

        // 第一轮：解 cork，不发数据
        shared.lock().unwrap().writable.push_back(4096);
        f.worker.step_transmit();
        assert_eq!(shared.lock().unwrap().uncork_calls, 1);
        assert!(shared.lock().unwrap().writes.is_empty());

        // 第二轮：writable=4096，精确渲染并写出 4096 字节
        f.worker.step_transmit();
        assert_eq!(f.host.lock().unwrap().renders, vec![4096]);
        assert_eq!(shared.lock().unwrap().writes, vec![4096]);

        // 流报告 Terminated：槽位清空，后续迭代不再写出
        shared.lock().unwrap().state = StreamState::Terminated;
        shared.lock().unwrap().writable.push_back(4096);
        f.worker.step_transmit();
        assert!(f.worker.stream.is_none());
        assert_eq!(f.outq_rx.try_recv(), Some(CoreMsg::StreamGone));
        assert_eq!(shared.lock().unwrap().writes.len(), 1);

        // connected 门控保持置位，只有显式消息能改写它
        assert!(f.worker.connected);

        f.worker.step_transmit();
        assert_eq!(shared.lock().unwrap().writes.len(), 1);

        // 显式 ConnectionLost 关闭门控
        f.worker.dispatch(SinkMsg::ConnectionLost);
        assert!(!f.worker.connected);
    }

    #[test]
    fn test_clean_shutdown_via_message() {
        let mut f = fixture();
        f.worker.dispatch(SinkMsg::Shutdown);
        assert!(f.worker.shutdown);
    }
}
