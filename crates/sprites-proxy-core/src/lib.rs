//! sprites-proxy-core: Shared protocol library for the sprites TCP proxy.
//!
//! Provides the RFC 6455 frame codec, the sprites-tcp-proxy-v1 control
//! messages and endpoint descriptor, the error taxonomy, and HMAC connect
//! tokens.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Frame, FrameDecoder, Opcode};
pub use error::{ProxyError, ProxyResult};
pub use messages::{
    ConnectedAck, InitHint, InitRequest, TcpProxyInfo, Visibility, MAX_INIT_BYTES, PROTOCOL_ID,
};
pub use token::{create_token, verify_token};
