//! Binary protocol: framing, message codecs, and the TCP server.

pub mod frame;
pub mod messages;
pub mod server;
pub mod session;

pub use frame::{FrameHeader, MAX_FRAME_SIZE, MsgType, read_frame, write_frame};
pub use server::{ServerHandle, start_server};
