//! 模块生命周期：加载、控制循环、卸载
//!
//! 加载即建连：校验参数、起渲染线程、注册 sink 门面，
//! 然后阻塞式跑完控制通道握手。地址解析失败让加载直接报错，
//! 连接被拒不让——连接进 Failed 态，按重连策略处理。
//!
//! 控制循环做三件事：监听控制 socket（Ready 之后对端来帧
//! 意味着挂断或协议错），消化渲染线程上行消息
//! （UnloadModule / StreamGone），到点执行重连。
//!
//! 卸载顺序固定：sink 摘除路由图 → 停渲染线程并 join
//! （流句柄随渲染线程一起释放）→ 断控制通道。

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{ConfigError, ModuleConfig, ReconnectPolicy};
use crate::msgq;
use crate::remote::{ConnectionError, ConnectionState, Effect, TcpConnection, TcpRemoteStream};
use crate::rtpoll::{Interest, Rtpoll};
use crate::sink::host::RenderHost;
use crate::sink::worker::RenderWorker;
use crate::sink::{CoreMsg, SinkState, TunnelSink};
use crate::stats::RelayStats;

/// 控制循环的兜底唤醒周期（检查外部停机标志用）
const CONTROL_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub struct Module {
    config: ModuleConfig,
    sink: TunnelSink,
    connection: Option<TcpConnection>,
    outq: msgq::MsgReceiver<CoreMsg>,
    rtpoll: Rtpoll,
    stats: Arc<RelayStats>,
    reconnect_at: Option<Instant>,
}

impl Module {
    /// 加载模块：校验、起渲染线程、接上远端
    pub fn load(config: ModuleConfig, host: Box<dyn RenderHost>) -> Result<Self, ModuleError> {
        config.validate()?;
        log::info!(
            "loading tunnel sink '{}' -> {} ({})",
            config.sink_name,
            config.server,
            config.spec
        );

        let stats = Arc::new(RelayStats::new());
        let (inq_tx, inq_rx) = msgq::channel()?;
        let (outq_tx, outq_rx) = msgq::channel()?;

        let worker_stats = Arc::clone(&stats);
        let thread = thread::Builder::new()
            .name("tunnel-sink-render".to_owned())
            .spawn(move || {
                RenderWorker::new(inq_rx, outq_tx, host, worker_stats).run();
            })?;

        let sink = TunnelSink::new(
            config.sink_name.clone(),
            config.spec,
            config.map.clone(),
            config.properties.clone(),
            inq_tx,
            thread,
        );
        sink.set_state(SinkState::Idle);

        let rtpoll = Rtpoll::new(outq_rx.wake_fd());
        let mut module = Self {
            config,
            sink,
            connection: None,
            outq: outq_rx,
            rtpoll,
            stats,
            reconnect_at: None,
        };
        module.connect()?;
        Ok(module)
    }

    pub fn sink(&self) -> &TunnelSink {
        &self.sink
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(|c| c.state())
    }

    /// 建控制通道并跑完握手
    fn connect(&mut self) -> Result<(), ModuleError> {
        let mut connection = TcpConnection::new(
            &self.config.server,
            &self.config.sink_name,
            &self.config.app_name,
        );
        let effects = connection.establish()?;
        self.connection = Some(connection);
        self.handle_effects(effects);
        Ok(())
    }

    /// 控制循环；外部停机标志置位或渲染线程请求卸载时返回
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::debug!("module control loop running");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("shutdown requested");
                return;
            }

            if let Some(at) = self.reconnect_at {
                if Instant::now() >= at {
                    self.reconnect_at = None;
                    log::info!("attempting to reconnect to {}", self.config.server);
                    match self.connect() {
                        Ok(()) => {}
                        Err(e) => {
                            // 建连期间解析都失败了，按失败连接走策略
                            log::error!("reconnect failed: {}", e);
                            self.schedule_reconnect();
                        }
                    }
                }
            }

            let other = self
                .connection
                .as_ref()
                .and_then(|c| c.read_fd())
                .map(|fd| (fd, Interest::Readable));
            let timeout = match self.reconnect_at {
                Some(at) => at.saturating_duration_since(Instant::now()).min(CONTROL_TICK),
                None => CONTROL_TICK,
            };

            match self.rtpoll.wait(other, Some(timeout)) {
                Err(e) => {
                    log::error!("control poll failed: {}", e);
                    return;
                }
                Ok(outcome) => {
                    if outcome.wake {
                        self.outq.drain_wake();
                        while let Some(msg) = self.outq.try_recv() {
                            match msg {
                                CoreMsg::UnloadModule => {
                                    log::error!("render thread requested module unload");
                                    return;
                                }
                                CoreMsg::StreamGone => {
                                    // 连接仍然 Ready 时不重建流，只是停止写出
                                    log::info!("stream released; playback halted");
                                }
                            }
                        }
                    }
                    if outcome.ready || outcome.hangup {
                        let effects = match self.connection.as_mut() {
                            Some(connection) => connection.on_readable(),
                            None => vec![],
                        };
                        self.handle_effects(effects);
                    }
                }
            }
        }
    }

    /// 卸载模块（固定顺序，见模块文档）
    pub fn unload(mut self) {
        log::info!("unloading tunnel sink '{}'", self.sink.name());
        self.sink.unlink();
        self.sink.shutdown_and_join();
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.disconnect();
        }
        log::info!("{}", self.stats.snapshot());
    }

    /// 消化连接层交还的跨层副作用
    fn handle_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::CreateStream => {
                    match TcpRemoteStream::connect(
                        &self.config.server,
                        self.config.spec,
                        Arc::clone(&self.stats),
                    ) {
                        Ok(stream) => {
                            self.sink.connection_established(Box::new(stream));
                            self.sink.set_state(SinkState::Running);
                        }
                        Err(e) => {
                            log::error!("failed to create stream: {}", e);
                            match self.connection.as_mut() {
                                Some(connection) => queue.extend(connection.disconnect()),
                                None => queue.push_back(Effect::PostConnectionLost),
                            }
                        }
                    }
                }
                Effect::PostConnectionLost => {
                    self.sink.connection_lost();
                    self.connection = None;
                    self.schedule_reconnect();
                }
                // 通道内副作用由连接驱动当场执行，不会走到这里
                Effect::SendHello | Effect::SendSetName | Effect::ReleaseConnection => {}
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.config.reconnect {
            ReconnectPolicy::Never => {
                log::info!("connection lost; not reconnecting (policy: never)");
            }
            ReconnectPolicy::After(delay) => {
                log::info!("connection lost; reconnecting in {:?}", delay);
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
    }
}
