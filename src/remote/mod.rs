//! 远端服务器客户端（控制通道 + 数据通道）
//!
//! - state: 连接/流生命周期迁移表（纯函数，可独立测试）
//! - wire: 握手帧编解码
//! - connection: 控制通道驱动
//! - stream: 数据通道流（裸 PCM，带发送节拍与背压）

pub mod connection;
pub mod state;
pub mod stream;
pub mod wire;

pub use connection::{ConnectionError, TcpConnection};
pub use state::{ConnectionState, Effect, StreamState};
pub use stream::{RemoteStream, StreamError, TcpRemoteStream};
