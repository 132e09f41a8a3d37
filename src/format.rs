//! 采样规格与声道映射
//!
//! 字节 ↔ 时长换算统一按帧对齐，避免把半帧交给传输层
//! 默认值对齐宿主音频服务器的默认规格：s16le / 44100Hz / 立体声

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 声道数上限
pub const MAX_CHANNELS: u8 = 32;

/// 采样率上限
pub const MAX_RATE: u32 = 768_000;

/// 采样格式（线性 PCM，little-endian）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le => 4,
            Self::F32Le => 4,
        }
    }

    /// 线上协议格式编码
    pub fn wire_code(self) -> u8 {
        match self {
            Self::S16Le => 0,
            Self::S24Le => 1,
            Self::S32Le => 2,
            Self::F32Le => 3,
        }
    }

    /// 从线上协议编码还原
    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::S16Le),
            1 => Some(Self::S24Le),
            2 => Some(Self::S32Le),
            3 => Some(Self::F32Le),
            _ => None,
        }
    }

    /// 规格字符串名（模块参数里使用的拼写）
    pub fn name(self) -> &'static str {
        match self {
            Self::S16Le => "s16le",
            Self::S24Le => "s24le",
            Self::S32Le => "s32le",
            Self::F32Le => "float32le",
        }
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s16le" | "s16" => Ok(Self::S16Le),
            "s24le" | "s24" => Ok(Self::S24Le),
            "s32le" | "s32" => Ok(Self::S32Le),
            "float32le" | "f32le" | "float32" => Ok(Self::F32Le),
            other => Err(format!("unknown sample format: {}", other)),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 采样规格
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// 规格是否合法
    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.rate <= MAX_RATE && self.channels >= 1 && self.channels <= MAX_CHANNELS
    }

    /// 每帧字节数（一帧 = 所有声道各一个样本）
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// 每秒字节数
    #[inline]
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// 时长换算为字节数，向下对齐到帧边界
    pub fn duration_to_bytes(&self, d: Duration) -> usize {
        let bytes = (d.as_nanos() * self.bytes_per_second() as u128) / 1_000_000_000;
        self.align_down(bytes as usize)
    }

    /// 字节数换算为时长
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        let nanos = (bytes as u128 * 1_000_000_000) / bps as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// 向下对齐到帧边界
    #[inline]
    pub fn align_down(&self, bytes: usize) -> usize {
        let frame = self.frame_size();
        if frame == 0 {
            return 0;
        }
        bytes - (bytes % frame)
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        // 宿主默认规格
        Self::new(SampleFormat::S16Le, 44_100, 2)
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.format, self.rate, self.channels)
    }
}

/// 声道位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearLeft,
    RearRight,
    Lfe,
    SideLeft,
    SideRight,
    Aux(u8),
}

impl ChannelPosition {
    fn name(self) -> String {
        match self {
            Self::Mono => "mono".into(),
            Self::FrontLeft => "front-left".into(),
            Self::FrontRight => "front-right".into(),
            Self::FrontCenter => "front-center".into(),
            Self::RearLeft => "rear-left".into(),
            Self::RearRight => "rear-right".into(),
            Self::Lfe => "lfe".into(),
            Self::SideLeft => "side-left".into(),
            Self::SideRight => "side-right".into(),
            Self::Aux(n) => format!("aux{}", n),
        }
    }
}

/// 声道映射
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    /// 按声道数生成默认映射（宿主 DEFAULT 模式的近似）
    pub fn default_for(channels: u8) -> Self {
        use ChannelPosition::*;
        let positions = match channels {
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => vec![FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            8 => vec![
                FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight, SideLeft, SideRight,
            ],
            n => (0..n).map(Aux).collect(),
        };
        Self { positions }
    }

    #[inline]
    pub fn channels(&self) -> u8 {
        self.positions.len() as u8
    }

    /// 与采样规格的声道数是否一致
    pub fn matches(&self, spec: &SampleSpec) -> bool {
        self.channels() == spec.channels
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.positions.iter().map(|p| p.name()).collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 44_100, 2);
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_per_second(), 176_400);

        let spec = SampleSpec::new(SampleFormat::S24Le, 96_000, 2);
        assert_eq!(spec.frame_size(), 6);
    }

    #[test]
    fn test_duration_to_bytes_frame_aligned() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 2);
        // 250ms @ 48kHz 立体声 s16 = 48000 byte
        assert_eq!(spec.duration_to_bytes(Duration::from_millis(250)), 48_000);
        // 任意时长的结果都必须对齐到 4 字节帧
        let b = spec.duration_to_bytes(Duration::from_micros(1_234_567));
        assert_eq!(b % spec.frame_size(), 0);
    }

    #[test]
    fn test_bytes_to_duration_roundtrip() {
        let spec = SampleSpec::default();
        let d = spec.bytes_to_duration(spec.bytes_per_second());
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn test_spec_validity() {
        assert!(SampleSpec::default().is_valid());
        assert!(!SampleSpec::new(SampleFormat::S16Le, 0, 2).is_valid());
        assert!(!SampleSpec::new(SampleFormat::S16Le, 44_100, 0).is_valid());
        assert!(!SampleSpec::new(SampleFormat::S16Le, 44_100, 64).is_valid());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("s16le".parse::<SampleFormat>().unwrap(), SampleFormat::S16Le);
        assert_eq!(
            "float32le".parse::<SampleFormat>().unwrap(),
            SampleFormat::F32Le
        );
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_wire_code_roundtrip() {
        for fmt in [
            SampleFormat::S16Le,
            SampleFormat::S24Le,
            SampleFormat::S32Le,
            SampleFormat::F32Le,
        ] {
            assert_eq!(SampleFormat::from_wire_code(fmt.wire_code()), Some(fmt));
        }
        assert_eq!(SampleFormat::from_wire_code(0xFF), None);
    }

    #[test]
    fn test_default_channel_map() {
        let map = ChannelMap::default_for(2);
        assert_eq!(map.channels(), 2);
        assert!(map.matches(&SampleSpec::default()));

        let map = ChannelMap::default_for(7);
        assert_eq!(map.channels(), 7);
    }
}
