use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::AgentConfig;

const AGENT_CONFIG_FILE: &str = "agent.toml";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn agent_config_path(&self) -> PathBuf {
        self.config_dir.join(AGENT_CONFIG_FILE)
    }

    /// 加载代理配置，文件不存在时使用默认配置
    pub fn load_agent(&self) -> Result<AgentConfig> {
        let config_path = self.agent_config_path();

        if !config_path.exists() {
            return Ok(AgentConfig::default());
        }

        let config = Config::builder()
            .add_source(File::new(
                config_path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载并校验
    pub fn validate(&self) -> Result<()> {
        self.load_agent()?.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaMode;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_default_agent_config() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(temp_dir.path());

        let config = loader.load_agent().unwrap();
        assert_eq!(config.device.device_id, "34020000001320000001");
        assert!(loader.validate().is_ok());
    }

    #[test]
    fn test_load_agent_config_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_content = r#"
[device]
device_id = "44010200491320000123"
password = "12345678"
channel_count = 4

[platform]
id = "44010200492000000001"
realm = "4401020049"
ip = "192.168.1.100"
port = 15060

[registration]
expires = 600
keepalive_interval_secs = 30

[media]
local_ip = "192.168.1.64"
port_start = 40000
port_end = 40100
mode = "process"
program = "ffmpeg"
args = ["-re", "-i", "demo.mp4", "rtp://{remote_addr}:{remote_port}?localport={local_port}"]

[[channels]]
name = "Gate"
location = "North"

[[channels]]
id = "44010200491310000001"
name = "Lobby"
online = false
"#;

        fs::write(temp_dir.path().join("agent.toml"), config_content).unwrap();

        let loader = ConfigLoader::new(temp_dir.path());
        let config = loader.load_agent().unwrap();

        assert_eq!(config.device.device_id, "44010200491320000123");
        assert_eq!(config.device.password.as_deref(), Some("12345678"));
        assert_eq!(config.platform.port, 15060);
        assert_eq!(config.registration.expires, 600);
        // 未配置的字段取默认值
        assert_eq!(config.registration.retry_interval_secs, 30);
        assert_eq!(config.sip.bind_addr, "0.0.0.0:5060");
        assert_eq!(config.media.mode, MediaMode::Process);
        assert_eq!(config.media.args.len(), 4);
        assert_eq!(config.channels.len(), 2);
        assert!(config.channels[0].online);
        assert!(!config.channels[1].online);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_file_errors() {
        let temp_dir = tempdir().unwrap();
        fs::write(
            temp_dir.path().join("agent.toml"),
            "[media]\nport_start = 30010\nport_end = 30000\n",
        )
        .unwrap();

        let loader = ConfigLoader::new(temp_dir.path());
        assert!(loader.validate().is_err());
    }
}
