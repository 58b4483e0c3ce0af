//! hookscope protocol - Wire formats for the broker subscription
//!
//! This crate provides:
//! - `parse` - decoding of the hook event JSON published by the hook scripts
//! - `resp` - RESP2 framing for the pub/sub broker connection

pub mod parse;
pub mod resp;

pub use parse::{
    decode_hook_event, preview, DecodeError, RawContext, RawCore, RawHookMessage, RawPayload,
    PREVIEW_CHARS,
};
pub use resp::{PubSubFrame, RespCodec, RespCommand, RespError, RespValue, MAX_FRAME_SIZE};
