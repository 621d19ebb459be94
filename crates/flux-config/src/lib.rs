pub mod agent;
pub mod loader;

pub use agent::{
    AgentConfig, ChannelSection, DeviceSection, MediaMode, MediaSection, PlatformSection, RegistrationSection,
    SipSection,
};
pub use loader::ConfigLoader;
