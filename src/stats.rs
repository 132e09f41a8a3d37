//! 转发统计
//!
//! 渲染线程热路径上只做 relaxed 原子自增；计数器按 cache line 填充，
//! 避免渲染线程与控制线程读写相邻计数时的 false sharing

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// 转发计数器集合
pub struct RelayStats {
    bytes_sent: CachePadded<AtomicU64>,
    chunks_rendered: CachePadded<AtomicU64>,
    write_failures: CachePadded<AtomicU64>,
    uncorks: CachePadded<AtomicU64>,
    latency_queries: CachePadded<AtomicU64>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: CachePadded::new(AtomicU64::new(0)),
            chunks_rendered: CachePadded::new(AtomicU64::new(0)),
            write_failures: CachePadded::new(AtomicU64::new(0)),
            uncorks: CachePadded::new(AtomicU64::new(0)),
            latency_queries: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn note_chunk_rendered(&self) {
        self.chunks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn note_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn note_uncork(&self) {
        self.uncorks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn note_latency_query(&self) {
        self.latency_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// 一致性要求不高的读侧快照
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_rendered: self.chunks_rendered.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            uncorks: self.uncorks.load(Ordering::Relaxed),
            latency_queries: self.latency_queries.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 某一时刻的统计快照
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub chunks_rendered: u64,
    pub write_failures: u64,
    pub uncorks: u64,
    pub latency_queries: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} bytes in {} chunks | write failures: {} | uncorks: {} | latency queries: {}",
            self.bytes_sent,
            self.chunks_rendered,
            self.write_failures,
            self.uncorks,
            self.latency_queries
        )
    }
}
