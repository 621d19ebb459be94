// GB28181 设备侧信令代理
// 注册保活、MANSCDP 命令应答、点播协商与推流任务管理

pub mod agent;
pub mod error;
pub mod identity;
pub mod invite;
pub mod manscdp;
pub mod media;
pub mod register;
pub mod session;
pub mod signaling;
pub mod sip;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentDeps, AgentSettings};
pub use error::{AgentError, Result};
pub use identity::{DeviceIdentity, DeviceProfile};
pub use invite::{CallNegotiator, NegotiatorConfig};
pub use register::{RegistrationConfig, RegistrationManager, RegistrationPhase};
pub use session::{CallSession, CallState, SessionRegistry};
pub use signaling::{SignalEvent, Signaling, TransactionId};
