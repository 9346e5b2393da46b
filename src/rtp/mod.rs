pub mod clock;
pub mod jitter;
pub mod packet;
pub mod receiver;

pub use clock::RtpClock;
pub use jitter::{BufferState, JitterBuffer, JitterBufferConfig, JitterBufferStats};
pub use packet::{DecodeError, HeaderExtension, RtpPacket};
pub use receiver::{Playout, ReceiverConfig, RtpReceiver};
