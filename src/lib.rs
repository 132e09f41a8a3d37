//! Tunnel Sink - 把本地音频转发到远端服务器的网络 sink
//!
//! 设计目标：
//! - 渲染线程独占数据面：流句柄经消息转移所有权，无共享可变状态
//! - 背压一路传导：远端不消费就不渲染
//! - 块引用零滞留：每轮迭代写出即释放

#![allow(dead_code)]

pub mod config;
pub mod format;
pub mod memchunk;
pub mod module;
pub mod msgq;
pub mod remote;
pub mod rtpoll;
pub mod sink;
pub mod stats;
