use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// 设备代理配置（agent.toml）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceSection,
    pub platform: PlatformSection,
    pub sip: SipSection,
    pub registration: RegistrationSection,
    pub media: MediaSection,
    /// 为空时按 device.channel_count 自动编号
    pub channels: Vec<ChannelSection>,
}

/// 设备身份与描述
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    /// 20 位国标编码
    pub device_id: String,
    /// 注册密码，不配置则不做鉴权
    pub password: Option<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: Option<String>,
    pub channel_count: u32,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: "34020000001320000001".to_string(),
            password: None,
            name: "FluxCamera".to_string(),
            manufacturer: "Flux".to_string(),
            model: "FX-IPC".to_string(),
            firmware: None,
            channel_count: 1,
        }
    }
}

/// 上级平台
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformSection {
    pub id: String,
    pub realm: String,
    pub ip: String,
    pub port: u16,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 5060,
        }
    }
}

/// SIP 传输
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipSection {
    pub bind_addr: String,
    /// 写入 Via / Contact 的本机地址
    pub local_ip: String,
    pub user_agent: Option<String>,
}

impl Default for SipSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            local_ip: "127.0.0.1".to_string(),
            user_agent: None,
        }
    }
}

/// 注册与心跳（时间单位：秒）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationSection {
    pub expires: u32,
    pub register_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub keepalive_interval_secs: u64,
    pub unregister_on_stop: bool,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            expires: 3600,
            register_timeout_secs: 10,
            retry_interval_secs: 30,
            keepalive_interval_secs: 60,
            unregister_on_stop: true,
        }
    }
}

/// 推流方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// 内置测试码流
    TestPattern,
    /// 外部程序推流
    Process,
}

/// 媒体面
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaSection {
    /// 写入 SDP answer 的本机媒体地址
    pub local_ip: String,
    pub port_start: u16,
    pub port_end: u16,
    /// 0 表示不检查 ACK
    pub ack_timeout_secs: u64,
    pub mode: MediaMode,
    pub program: String,
    /// 支持 {local_port} {remote_addr} {remote_port} {call_id} {ssrc}
    pub args: Vec<String>,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            port_start: 30000,
            port_end: 30100,
            ack_timeout_secs: 32,
            mode: MediaMode::TestPattern,
            program: "ffmpeg".to_string(),
            args: Vec::new(),
        }
    }
}

/// 目录中的一个通道
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSection {
    /// 缺省为 <device_id><序号>
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl AgentConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let device_id = &self.device.device_id;
        if device_id.len() != 20 || !device_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("device.device_id must be 20 digits, got {:?}", device_id));
        }

        if self.platform.id.is_empty() || self.platform.realm.is_empty() {
            return Err(anyhow!("platform.id and platform.realm must not be empty"));
        }

        if self.platform.port == 0 {
            return Err(anyhow!("platform.port must be greater than 0"));
        }

        let reg = &self.registration;
        if reg.expires == 0 {
            return Err(anyhow!("registration.expires must be greater than 0"));
        }
        if reg.register_timeout_secs == 0 || reg.retry_interval_secs == 0 || reg.keepalive_interval_secs == 0 {
            return Err(anyhow!("registration intervals must be greater than 0"));
        }

        let media = &self.media;
        if media.port_start > media.port_end {
            return Err(anyhow!(
                "media.port_start ({}) cannot be greater than media.port_end ({})",
                media.port_start,
                media.port_end
            ));
        }
        let first_even = (u32::from(media.port_start) + 1) & !1;
        if first_even > u32::from(media.port_end) {
            return Err(anyhow!(
                "media port range {}-{} holds no even port",
                media.port_start,
                media.port_end
            ));
        }

        if media.mode == MediaMode::Process && media.program.trim().is_empty() {
            return Err(anyhow!("media.program is required in process mode"));
        }

        Ok(())
    }

    /// 导出为 TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
