// 设备身份与描述信息（进程生命周期内只读）

/// 设备注册身份
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// 设备 ID（20 位国标编码）
    pub device_id: String,

    /// SIP 域
    pub realm: String,

    /// 平台 SIP ID
    pub platform_id: String,

    /// 平台地址
    pub platform_ip: String,

    /// 平台端口
    pub platform_port: u16,

    /// 注册密码（None 时不做 Digest 鉴权）
    pub password: Option<String>,
}

impl DeviceIdentity {
    /// 平台 Request-URI
    pub fn platform_uri(&self) -> String {
        format!("sip:{}@{}", self.platform_id, self.realm)
    }

    /// 设备 AOR
    pub fn device_uri(&self) -> String {
        format!("sip:{}@{}", self.device_id, self.realm)
    }
}

/// DeviceInfo 应答使用的设备描述
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub channel_count: u32,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "FluxCamera".to_string(),
            manufacturer: "Flux".to_string(),
            model: "FX-IPC".to_string(),
            firmware: env!("CARGO_PKG_VERSION").to_string(),
            channel_count: 1,
        }
    }
}
