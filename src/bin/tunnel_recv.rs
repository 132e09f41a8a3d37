//! Tunnel Recv - 回环测试用的接收端
//!
//! 按线上协议受理控制通道与数据通道：控制通道完成握手后挂住，
//! 数据通道确认采样规格后持续收 PCM 并统计吞吐。
//! 收到的音频直接丢弃，这只是给 tunnel-sink 当对端的工具。

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use tunnel_sink::format::SampleFormat;
use tunnel_sink::remote::wire::{Frame, ACK_OK};

/// Tunnel Recv - loopback receiver for tunnel-sink
#[derive(Parser)]
#[command(name = "tunnel-recv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address
    #[arg(value_name = "ADDR", default_value = "127.0.0.1:4713")]
    listen: String,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    ctrlc::set_handler(|| {
        std::process::exit(0);
    })?;

    let listener = TcpListener::bind(&cli.listen)
        .with_context(|| format!("cannot listen on {}", cli.listen))?;
    println!("Tunnel Recv listening on {}", cli.listen);
    println!("Press Ctrl+C to stop.\n");

    for socket in listener.incoming() {
        match socket {
            Ok(socket) => {
                let peer = socket
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".to_owned());
                thread::Builder::new()
                    .name(format!("tunnel-recv-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve(socket, &peer) {
                            log::warn!("connection from {} ended with error: {}", peer, e);
                        }
                    })?;
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }

    Ok(())
}

/// 单条连接：第一帧决定这是控制通道还是数据通道
fn serve(mut socket: TcpStream, peer: &str) -> anyhow::Result<()> {
    match Frame::read_from(&mut socket)? {
        Frame::Hello { version, sink_name } => {
            log::info!(
                "control channel from {}: protocol v{}, sink '{}'",
                peer,
                version,
                sink_name
            );
            Frame::Ack { code: ACK_OK }.write_to(&mut socket)?;
            serve_control(socket, peer)
        }
        Frame::StreamHello {
            rate,
            channels,
            format,
        } => {
            let format_name = SampleFormat::from_wire_code(format)
                .map(|f| f.name())
                .unwrap_or("?");
            log::info!(
                "data channel from {}: {} Hz, {} ch, {}",
                peer,
                rate,
                channels,
                format_name
            );
            Frame::Ack { code: ACK_OK }.write_to(&mut socket)?;
            serve_data(socket, peer)
        }
        other => anyhow::bail!("unexpected first frame: {:?}", other),
    }
}

/// 控制通道：答完 SetName 后挂住直到对端断开
fn serve_control(mut socket: TcpStream, peer: &str) -> anyhow::Result<()> {
    loop {
        match Frame::read_from(&mut socket) {
            Ok(Frame::SetName { app_name }) => {
                log::info!("{} identifies as '{}'", peer, app_name);
                Frame::Ack { code: ACK_OK }.write_to(&mut socket)?;
            }
            Ok(frame) => log::debug!("ignoring control frame from {}: {:?}", peer, frame),
            Err(_) => {
                log::info!("control channel from {} closed", peer);
                return Ok(());
            }
        }
    }
}

/// 数据通道：收裸 PCM，统计吞吐，音频本身丢弃
fn serve_data(mut socket: TcpStream, peer: &str) -> anyhow::Result<()> {
    let started = Instant::now();
    let mut total: u64 = 0;
    let mut last_report: u64 = 0;
    let mut buf = [0u8; 8192];

    loop {
        match socket.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                // 每 1 MiB 报一次吞吐
                if total - last_report >= 1024 * 1024 {
                    last_report = total;
                    let rate = total as f64 / started.elapsed().as_secs_f64().max(0.001);
                    log::debug!(
                        "{}: {} bytes received ({:.1} KiB/s)",
                        peer,
                        total,
                        rate / 1024.0
                    );
                }
            }
            Err(e) => {
                log::info!("data channel from {} closed: {}", peer, e);
                break;
            }
        }
    }

    log::info!(
        "data channel from {} done: {} bytes in {:.1}s",
        peer,
        total,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
