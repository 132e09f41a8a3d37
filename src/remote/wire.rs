//! 控制/数据通道线上协议
//!
//! 控制通道全程走帧：[type u8][len u32 be][payload]
//! 数据通道只有开头一帧 StreamHello，之后是裸 PCM 字节流——
//! 裸流对 short write 免疫，不存在帧边界错位问题。
//!
//! 字符串编码：u16 be 长度 + UTF-8。

use std::io::{self, Read, Write};

use thiserror::Error;

/// 协议版本
pub const PROTOCOL_VERSION: u8 = 1;

/// 单帧 payload 上限，防御异常对端
pub const MAX_PAYLOAD: u32 = 64 * 1024;

/// Ack 帧里的成功码
pub const ACK_OK: u8 = 0;

const FRAME_HELLO: u8 = 1;
const FRAME_ACK: u8 = 2;
const FRAME_SET_NAME: u8 = 3;
const FRAME_STREAM_HELLO: u8 = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("wire i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown frame type: {0}")]
    UnknownFrame(u8),
    #[error("malformed frame payload: {0}")]
    BadPayload(&'static str),
    #[error("frame payload too large: {0} bytes")]
    PayloadTooLarge(u32),
    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),
}

/// 控制/数据通道的握手帧
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// 客户端问候：协议版本 + sink 名
    Hello { version: u8, sink_name: String },
    /// 服务端确认；code != ACK_OK 表示拒绝
    Ack { code: u8 },
    /// 客户端应用名
    SetName { app_name: String },
    /// 数据通道第一帧：采样规格
    StreamHello { rate: u32, channels: u8, format: u8 },
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn take_string(payload: &[u8], pos: &mut usize) -> Result<String, WireError> {
    if payload.len() < *pos + 2 {
        return Err(WireError::BadPayload("truncated string length"));
    }
    let len = u16::from_be_bytes([payload[*pos], payload[*pos + 1]]) as usize;
    *pos += 2;
    if payload.len() < *pos + len {
        return Err(WireError::BadPayload("truncated string body"));
    }
    let s = std::str::from_utf8(&payload[*pos..*pos + len])
        .map_err(|_| WireError::BadPayload("string is not utf-8"))?
        .to_owned();
    *pos += len;
    Ok(s)
}

impl Frame {
    fn frame_type(&self) -> u8 {
        match self {
            Self::Hello { .. } => FRAME_HELLO,
            Self::Ack { .. } => FRAME_ACK,
            Self::SetName { .. } => FRAME_SET_NAME,
            Self::StreamHello { .. } => FRAME_STREAM_HELLO,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Hello { version, sink_name } => {
                buf.push(*version);
                put_string(&mut buf, sink_name);
            }
            Self::Ack { code } => buf.push(*code),
            Self::SetName { app_name } => put_string(&mut buf, app_name),
            Self::StreamHello {
                rate,
                channels,
                format,
            } => {
                buf.extend_from_slice(&rate.to_be_bytes());
                buf.push(*channels);
                buf.push(*format);
            }
        }
        buf
    }

    /// 整帧写出（帧很小，一次 write_all）
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), WireError> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(self.frame_type());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        w.write_all(&frame)?;
        Ok(())
    }

    /// 阻塞读取一帧
    pub fn read_from<R: Read>(r: &mut R) -> Result<Frame, WireError> {
        let mut header = [0u8; 5];
        r.read_exact(&mut header)?;
        let frame_type = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)?;

        match frame_type {
            FRAME_HELLO => {
                if payload.is_empty() {
                    return Err(WireError::BadPayload("hello without version"));
                }
                let version = payload[0];
                if version != PROTOCOL_VERSION {
                    return Err(WireError::BadVersion(version));
                }
                let mut pos = 1;
                let sink_name = take_string(&payload, &mut pos)?;
                Ok(Frame::Hello { version, sink_name })
            }
            FRAME_ACK => {
                if payload.len() != 1 {
                    return Err(WireError::BadPayload("ack payload must be 1 byte"));
                }
                Ok(Frame::Ack { code: payload[0] })
            }
            FRAME_SET_NAME => {
                let mut pos = 0;
                let app_name = take_string(&payload, &mut pos)?;
                Ok(Frame::SetName { app_name })
            }
            FRAME_STREAM_HELLO => {
                if payload.len() != 6 {
                    return Err(WireError::BadPayload("stream hello payload must be 6 bytes"));
                }
                let rate = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::StreamHello {
                    rate,
                    channels: payload[4],
                    format: payload[5],
                })
            }
            other => Err(WireError::UnknownFrame(other)),
        }
    }
}
