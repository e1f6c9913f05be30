//! Tailnet Coordination Protocol Definitions
//!
//! This crate defines the wire types exchanged between peers and the
//! coordinator, the length-prefixed message codec, the multiplexing frame
//! format, and the DERP map topology types.

pub mod codec;
pub mod derp;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, TailnetCodec};
pub use derp::{DerpMap, DerpNode, DerpRegion, HomeParams};
pub use messages::*;
pub use mux::{Frame, FrameFlags, FrameType, MuxError, StreamId, SESSION_STREAM_ID};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum frame size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;
