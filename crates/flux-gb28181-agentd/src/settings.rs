// agent.toml → 代理库类型

use std::sync::Arc;
use std::time::Duration;

use flux_config::{AgentConfig, MediaMode};
use flux_gb28181_agent::manscdp::{ChannelInfo, ChannelStatus, StaticChannelDirectory};
use flux_gb28181_agent::media::{MediaPipeline, ProcessPipeline, TestPatternPipeline};
use flux_gb28181_agent::sip::SipEngineConfig;
use flux_gb28181_agent::{
    AgentSettings, DeviceIdentity, DeviceProfile, NegotiatorConfig, RegistrationConfig,
};

pub fn identity(config: &AgentConfig) -> DeviceIdentity {
    DeviceIdentity {
        device_id: config.device.device_id.clone(),
        realm: config.platform.realm.clone(),
        platform_id: config.platform.id.clone(),
        platform_ip: config.platform.ip.clone(),
        platform_port: config.platform.port,
        password: config.device.password.clone().filter(|p| !p.is_empty()),
    }
}

pub fn profile(config: &AgentConfig) -> DeviceProfile {
    let defaults = DeviceProfile::default();
    DeviceProfile {
        name: config.device.name.clone(),
        manufacturer: config.device.manufacturer.clone(),
        model: config.device.model.clone(),
        firmware: config.device.firmware.clone().unwrap_or(defaults.firmware),
        channel_count: channel_directory(config).len() as u32,
    }
}

pub fn agent_settings(config: &AgentConfig) -> AgentSettings {
    let reg = &config.registration;
    let media = &config.media;
    AgentSettings {
        registration: RegistrationConfig {
            expires: reg.expires,
            register_timeout: Duration::from_secs(reg.register_timeout_secs),
            retry_interval: Duration::from_secs(reg.retry_interval_secs),
            keepalive_interval: Duration::from_secs(reg.keepalive_interval_secs),
            unregister_on_stop: reg.unregister_on_stop,
        },
        negotiator: NegotiatorConfig {
            local_ip: media.local_ip.clone(),
            ack_timeout: (media.ack_timeout_secs > 0).then(|| Duration::from_secs(media.ack_timeout_secs)),
            ..Default::default()
        },
        port_start: media.port_start,
        port_end: media.port_end,
    }
}

pub fn engine_config(config: &AgentConfig) -> SipEngineConfig {
    let defaults = SipEngineConfig::default();
    SipEngineConfig {
        bind_addr: config.sip.bind_addr.clone(),
        local_ip: config.sip.local_ip.clone(),
        user_agent: config.sip.user_agent.clone().unwrap_or(defaults.user_agent),
        event_buffer: defaults.event_buffer,
    }
}

/// 配置了 [[channels]] 时按配置生成，否则按 channel_count 自动编号
pub fn channel_directory(config: &AgentConfig) -> StaticChannelDirectory {
    let device_id = &config.device.device_id;
    if config.channels.is_empty() {
        return StaticChannelDirectory::numbered(device_id, config.device.channel_count, "Camera", "");
    }

    let channels = config
        .channels
        .iter()
        .enumerate()
        .map(|(i, channel)| ChannelInfo {
            channel_id: channel
                .id
                .clone()
                .unwrap_or_else(|| format!("{}{:03}", device_id, i + 1)),
            name: channel.name.clone(),
            status: if channel.online { ChannelStatus::On } else { ChannelStatus::Off },
            location: channel.location.clone(),
        })
        .collect();
    StaticChannelDirectory::new(channels)
}

pub fn pipeline(config: &AgentConfig) -> Arc<dyn MediaPipeline> {
    match config.media.mode {
        MediaMode::TestPattern => Arc::new(TestPatternPipeline::new(config.media.local_ip.clone())),
        MediaMode::Process => Arc::new(ProcessPipeline::new(
            config.media.program.clone(),
            config.media.args.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_config::ChannelSection;
    use flux_gb28181_agent::manscdp::ChannelDirectory;

    #[test]
    fn test_identity_and_settings() {
        let mut config = AgentConfig::default();
        config.device.password = Some(String::new());
        config.media.ack_timeout_secs = 0;
        config.media.local_ip = "192.168.1.64".to_string();

        let identity = identity(&config);
        assert!(identity.password.is_none());
        assert_eq!(identity.platform_uri(), "sip:34020000002000000001@3402000000");

        let settings = agent_settings(&config);
        assert!(settings.negotiator.ack_timeout.is_none());
        assert_eq!(settings.negotiator.local_ip, "192.168.1.64");
        assert_eq!(settings.registration.keepalive_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_configured_channels() {
        let mut config = AgentConfig::default();
        config.channels = vec![
            ChannelSection {
                id: None,
                name: "Gate".to_string(),
                location: String::new(),
                online: true,
            },
            ChannelSection {
                id: Some("34020000001310000009".to_string()),
                name: "Lobby".to_string(),
                location: String::new(),
                online: false,
            },
        ];

        let channels = channel_directory(&config).list_channels(&config.device.device_id);

        assert_eq!(channels[0].channel_id, "34020000001320000001001");
        assert_eq!(channels[1].channel_id, "34020000001310000009");
        assert_eq!(channels[1].status, ChannelStatus::Off);
        assert_eq!(profile(&config).channel_count, 2);
    }
}
