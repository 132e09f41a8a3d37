//! 宿主渲染契约
//!
//! 渲染循环按远端可写量回调宿主混音图拉取音频——块大小由传输侧
//! 就绪程度决定，没有固定 block size。宿主自管 rewind 簿记，
//! 核心只负责把请求排干。
//!
//! ToneHost / SilenceHost 是可执行程序用的混音图替身。

use std::f64::consts::TAU;

use crate::format::{SampleFormat, SampleSpec};
use crate::memchunk::{MemBlock, MemChunk};

/// 宿主 sink 渲染契约
pub trait RenderHost: Send {
    /// 从混音图渲染至多 nbytes 的音频，返回的块不大于请求值
    fn render(&mut self, nbytes: usize) -> MemChunk;
    /// 宿主的 rewind 处理（簿记在宿主侧，这里只是排干请求）
    fn process_rewind(&mut self, nbytes: usize);
    /// 核心不认识的消息码的兜底处理
    fn handle_message(&mut self, code: u32);
}

/// 静音源
pub struct SilenceHost {
    spec: SampleSpec,
}

impl SilenceHost {
    pub fn new(spec: SampleSpec) -> Self {
        Self { spec }
    }
}

impl RenderHost for SilenceHost {
    fn render(&mut self, nbytes: usize) -> MemChunk {
        let nbytes = self.spec.align_down(nbytes);
        if nbytes == 0 {
            return MemChunk::empty();
        }
        MemChunk::from_block(MemBlock::new(vec![0u8; nbytes]))
    }

    fn process_rewind(&mut self, _nbytes: usize) {}

    fn handle_message(&mut self, code: u32) {
        log::debug!("silence host ignoring message code {}", code);
    }
}

/// 正弦波源
pub struct ToneHost {
    spec: SampleSpec,
    freq: f64,
    amplitude: f64,
    phase: f64,
}

impl ToneHost {
    pub fn new(spec: SampleSpec, freq: f64) -> Self {
        Self {
            spec,
            freq,
            amplitude: 0.25,
            phase: 0.0,
        }
    }

    fn push_sample(&self, out: &mut Vec<u8>, value: f64) {
        match self.spec.format {
            SampleFormat::S16Le => {
                let v = (value * i16::MAX as f64) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            SampleFormat::S24Le => {
                let v = (value * 8_388_607.0) as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            SampleFormat::S32Le => {
                let v = (value * i32::MAX as f64) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
            SampleFormat::F32Le => {
                out.extend_from_slice(&(value as f32).to_le_bytes());
            }
        }
    }
}

impl RenderHost for ToneHost {
    fn render(&mut self, nbytes: usize) -> MemChunk {
        let nbytes = self.spec.align_down(nbytes);
        let frames = nbytes / self.spec.frame_size().max(1);
        if frames == 0 {
            return MemChunk::empty();
        }

        let step = TAU * self.freq / self.spec.rate as f64;
        let mut data = Vec::with_capacity(nbytes);
        for _ in 0..frames {
            let value = self.amplitude * self.phase.sin();
            for _ in 0..self.spec.channels {
                self.push_sample(&mut data, value);
            }
            self.phase += step;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }

        MemChunk::from_block(MemBlock::new(data))
    }

    fn process_rewind(&mut self, _nbytes: usize) {
        // 波形连续性无所谓，rewind 只排干
    }

    fn handle_message(&mut self, code: u32) {
        log::debug!("tone host ignoring message code {}", code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SampleFormat, SampleSpec};

    #[test]
    fn test_silence_is_frame_aligned() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 2);
        let mut host = SilenceHost::new(spec);
        // 4097 不是帧的整数倍，向下对齐到 4096
        let chunk = host.render(4097);
        assert_eq!(chunk.length, 4096);
        assert!(chunk.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_renders_requested_size() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 2);
        let mut host = ToneHost::new(spec, 440.0);
        let chunk = host.render(4096);
        assert_eq!(chunk.length, 4096);
        // 正弦波不可能全零
        assert!(chunk.as_bytes().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_tone_smaller_than_frame_is_empty() {
        let spec = SampleSpec::new(SampleFormat::S32Le, 48_000, 2);
        let mut host = ToneHost::new(spec, 440.0);
        assert!(host.render(7).is_empty());
    }
}
