// GB28181 SIP 信令层（设备侧）

pub mod auth;
pub mod engine;
pub mod message;
pub mod sdp;

pub use auth::{compute_digest_response, DigestChallenge};
pub use engine::{SipEngineConfig, SipUdpEngine};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{MediaEndpoint, SdpSession};
