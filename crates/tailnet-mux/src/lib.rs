//! Frame multiplexer for tailnet RPC streams
//!
//! Every peer talks to the coordinator over a single byte connection. This
//! crate splits that connection into many logical streams so the
//! `Coordinate`, `StreamDERPMaps`, `RefreshResumeToken`, `PostTelemetry` and
//! `WorkspaceUpdates` RPCs can run side by side.
//!
//! # Stream Multiplexing
//!
//! Each frame carries a 10 byte header (see [`tailnet_proto::Frame`]):
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame type (data, close, reset, ping, pong, go-away)
//! - 1 byte: flags
//! - 4 bytes: payload length
//!
//! Clients open odd stream IDs and servers open even ones, so both sides can
//! open streams without coordination. Stream 0 carries session frames.

pub mod codec;
pub mod config;
pub mod listener;
pub mod session;
pub mod stream;

pub use codec::FrameCodec;
pub use config::MuxConfig;
pub use listener::{MuxConnector, MuxListener};
pub use session::{MuxSession, SessionRole};
pub use stream::{MuxRecvHalf, MuxSendHalf, MuxStream};
