//! Tunnel Sink - 网络转发音频 sink
//!
//! 把本地渲染出的 PCM 推给远端服务器播放。
//! 可执行程序用静音/测试音源代替宿主混音图。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use tunnel_sink::config::{self, ModuleConfig, ReconnectPolicy};
use tunnel_sink::format::{ChannelMap, SampleFormat, SampleSpec};
use tunnel_sink::module::Module;
use tunnel_sink::sink::host::{RenderHost, SilenceHost, ToneHost};

/// Tunnel Sink - forward rendered audio to a remote server
#[derive(Parser)]
#[command(name = "tunnel-sink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Remote server address (host:port)
    #[arg(value_name = "SERVER")]
    server: String,

    /// Sink name announced to the remote server
    #[arg(long, default_value = config::DEFAULT_SINK_NAME)]
    sink_name: String,

    /// Sample format (s16le, s24le, s32le, float32le)
    #[arg(short, long, default_value = "s16le")]
    format: String,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "44100")]
    rate: u32,

    /// Number of channels
    #[arg(short, long, default_value = "2")]
    channels: u8,

    /// Sink property (KEY=VALUE, may be given multiple times)
    #[arg(short = 'p', long = "property", value_name = "KEY=VALUE")]
    properties: Vec<String>,

    /// Reconnect policy: 'never' or delay in seconds
    #[arg(long, default_value = "never")]
    reconnect: String,

    /// Send a test tone at this frequency instead of silence
    #[arg(long, value_name = "HZ")]
    tone: Option<f64>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let format: SampleFormat = cli
        .format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let spec = SampleSpec::new(format, cli.rate, cli.channels);

    let mut config = ModuleConfig::new(&cli.server);
    config.sink_name = cli.sink_name.clone();
    config.spec = spec;
    config.map = ChannelMap::default_for(spec.channels);
    config.reconnect = cli
        .reconnect
        .parse::<ReconnectPolicy>()
        .context("bad --reconnect value")?;
    for property in &cli.properties {
        config
            .properties
            .push(config::parse_property(property).context("bad --property value")?);
    }

    let host: Box<dyn RenderHost> = match cli.tone {
        Some(freq) => {
            log::info!("rendering {} Hz test tone", freq);
            Box::new(ToneHost::new(spec, freq))
        }
        None => Box::new(SilenceHost::new(spec)),
    };

    // Ctrl+C 请求停机
    let shutdown = Arc::new(AtomicBool::new(false));
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })?;

    let mut module = Module::load(config, host).context("failed to load tunnel sink")?;

    println!("Tunnel Sink - {} -> {}", cli.sink_name, cli.server);
    println!("Press Ctrl+C to stop.\n");

    module.run(&shutdown);

    let snapshot = module.stats().snapshot();
    module.unload();
    println!("\n{}", snapshot);

    Ok(())
}
