// MANSCDP 应答文档生成
// 目录、设备信息、设备状态、控制结果、心跳

use chrono::NaiveDateTime;
use quick_xml::escape::escape;

use crate::identity::{DeviceIdentity, DeviceProfile};

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    On,
    Off,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::On => "ON",
            ChannelStatus::Off => "OFF",
        }
    }
}

/// 目录应答中的一个通道
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
    pub status: ChannelStatus,
    /// 安装地址
    pub location: String,
}

/// 设备通道目录（由外部提供通道数据）
pub trait ChannelDirectory: Send + Sync {
    fn list_channels(&self, device_id: &str) -> Vec<ChannelInfo>;
}

/// 由配置生成的固定通道目录
#[derive(Debug, Clone, Default)]
pub struct StaticChannelDirectory {
    channels: Vec<ChannelInfo>,
}

impl StaticChannelDirectory {
    pub fn new(channels: Vec<ChannelInfo>) -> Self {
        Self { channels }
    }

    /// 按 `<device_id><NNN>` 编号生成通道，至少一个
    pub fn numbered(device_id: &str, count: u32, name_prefix: &str, location: &str) -> Self {
        let channels = (1..=count.max(1))
            .map(|i| ChannelInfo {
                channel_id: format!("{}{:03}", device_id, i),
                name: format!("{}{}", name_prefix, i),
                status: ChannelStatus::On,
                location: location.to_string(),
            })
            .collect();
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl ChannelDirectory for StaticChannelDirectory {
    fn list_channels(&self, _device_id: &str) -> Vec<ChannelInfo> {
        self.channels.clone()
    }
}

/// 目录查询应答
pub fn build_catalog_response(sn: &str, identity: &DeviceIdentity, channels: &[ChannelInfo]) -> String {
    let device_id = escape(&identity.device_id);
    let civil_code = identity.device_id.get(..6).unwrap_or(&identity.device_id);

    let mut items = String::new();
    for channel in channels {
        items.push_str(&format!(
            "<Item>\r\n\
<DeviceID>{}</DeviceID>\r\n\
<Name>{}</Name>\r\n\
<Owner>Owner</Owner>\r\n\
<CivilCode>{}</CivilCode>\r\n\
<Address>{}</Address>\r\n\
<Parental>0</Parental>\r\n\
<ParentID>{}</ParentID>\r\n\
<SafetyWay>0</SafetyWay>\r\n\
<RegisterWay>1</RegisterWay>\r\n\
<Secrecy>0</Secrecy>\r\n\
<Status>{}</Status>\r\n\
</Item>\r\n",
            escape(&channel.channel_id),
            escape(&channel.name),
            escape(civil_code),
            escape(&channel.location),
            device_id,
            channel.status.as_str(),
        ));
    }

    format!(
        "{}\r\n<Response>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<SumNum>{}</SumNum>\r\n<DeviceList Num=\"{}\">\r\n{}</DeviceList>\r\n</Response>\r\n",
        XML_DECL,
        escape(sn),
        device_id,
        channels.len(),
        channels.len(),
        items
    )
}

/// 设备信息查询应答
pub fn build_device_info_response(sn: &str, device_id: &str, profile: &DeviceProfile) -> String {
    format!(
        "{}\r\n<Response>\r\n<CmdType>DeviceInfo</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<DeviceName>{}</DeviceName>\r\n<Result>OK</Result>\r\n<Manufacturer>{}</Manufacturer>\r\n\
<Model>{}</Model>\r\n<Firmware>{}</Firmware>\r\n<Channel>{}</Channel>\r\n</Response>\r\n",
        XML_DECL,
        escape(sn),
        escape(device_id),
        escape(&profile.name),
        escape(&profile.manufacturer),
        escape(&profile.model),
        escape(&profile.firmware),
        profile.channel_count
    )
}

/// 设备状态查询应答
pub fn build_device_status_response(sn: &str, device_id: &str, online: bool, device_time: NaiveDateTime) -> String {
    format!(
        "{}\r\n<Response>\r\n<CmdType>DeviceStatus</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<Result>OK</Result>\r\n<Online>{}</Online>\r\n<Status>OK</Status>\r\n<Encode>ON</Encode>\r\n\
<Record>OFF</Record>\r\n<DeviceTime>{}</DeviceTime>\r\n</Response>\r\n",
        XML_DECL,
        escape(sn),
        escape(device_id),
        if online { "ONLINE" } else { "OFFLINE" },
        device_time.format("%Y-%m-%dT%H:%M:%S")
    )
}

/// 设备控制结果
pub fn build_control_response(sn: &str, device_id: &str, ok: bool) -> String {
    format!(
        "{}\r\n<Response>\r\n<CmdType>DeviceControl</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<Result>{}</Result>\r\n</Response>\r\n",
        XML_DECL,
        escape(sn),
        escape(device_id),
        if ok { "OK" } else { "ERROR" }
    )
}

/// 无法解码的消息体的通用失败应答
pub fn build_error_response(sn: Option<&str>, device_id: &str) -> String {
    format!(
        "{}\r\n<Response>\r\n<CmdType>Unknown</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<Result>ERROR</Result>\r\n</Response>\r\n",
        XML_DECL,
        escape(sn.unwrap_or("")),
        escape(device_id)
    )
}

/// 心跳通知
pub fn build_keepalive(sn: u64, device_id: &str) -> String {
    format!(
        "{}\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n\
<Status>OK</Status>\r\n</Notify>\r\n",
        XML_DECL,
        sn,
        escape(device_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manscdp::command::{decode, CommandKind};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "34020000001320000001".to_string(),
            realm: "3402000000".to_string(),
            platform_id: "34020000002000000001".to_string(),
            platform_ip: "127.0.0.1".to_string(),
            platform_port: 5060,
            password: None,
        }
    }

    #[test]
    fn test_catalog_response_echoes_sn_and_lists_channels() {
        let identity = identity();
        let directory = StaticChannelDirectory::numbered(&identity.device_id, 2, "Camera", "Gate");
        let channels = directory.list_channels(&identity.device_id);

        let xml = build_catalog_response("123", &identity, &channels);

        let cmd = decode(&xml).unwrap();
        assert_eq!(cmd.root, "Response");
        assert_eq!(cmd.kind, CommandKind::Catalog);
        assert_eq!(cmd.sn, "123");
        assert_eq!(cmd.device_id, "34020000001320000001");

        assert!(xml.contains("<SumNum>2</SumNum>"));
        assert!(xml.contains("<DeviceList Num=\"2\">"));
        assert!(xml.contains("<DeviceID>34020000001320000001001</DeviceID>"));
        assert!(xml.contains("<DeviceID>34020000001320000001002</DeviceID>"));
        assert!(xml.contains("<CivilCode>340200</CivilCode>"));
        assert!(xml.contains("<Address>Gate</Address>"));
    }

    #[test]
    fn test_numbered_directory_has_at_least_one_channel() {
        let directory = StaticChannelDirectory::numbered("34020000001320000001", 0, "Cam", "");
        let channels = directory.list_channels("34020000001320000001");
        assert_eq!(channels.len(), 1);
        assert!(channels[0].channel_id.starts_with("34020000001320000001"));
    }

    #[test]
    fn test_text_is_escaped() {
        let identity = identity();
        let channels = vec![ChannelInfo {
            channel_id: "34020000001320000001001".to_string(),
            name: "Lobby <east> & door".to_string(),
            status: ChannelStatus::Off,
            location: String::new(),
        }];

        let xml = build_catalog_response("7", &identity, &channels);

        assert!(xml.contains("<Name>Lobby &lt;east&gt; &amp; door</Name>"));
        assert!(xml.contains("<Status>OFF</Status>"));
        assert!(decode(&xml).is_ok());
    }

    #[test]
    fn test_control_and_keepalive_documents() {
        let ok = decode(&build_control_response("11", "34020000001320000001", true)).unwrap();
        assert_eq!(ok.kind, CommandKind::DeviceControl);
        assert_eq!(ok.sn, "11");

        let keepalive = build_keepalive(42, "34020000001320000001");
        let cmd = decode(&keepalive).unwrap();
        assert_eq!(cmd.root, "Notify");
        assert_eq!(cmd.kind, CommandKind::Unknown("Keepalive".to_string()));
        assert_eq!(cmd.sn, "42");
    }

    #[test]
    fn test_device_status_document() {
        let time = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(8, 30, 0))
            .unwrap();
        let xml = build_device_status_response("9", "34020000001320000001", true, time);

        assert!(xml.contains("<Online>ONLINE</Online>"));
        assert!(xml.contains("<DeviceTime>2024-05-01T08:30:00</DeviceTime>"));
    }

    #[test]
    fn test_error_response_without_sn() {
        let cmd = decode(&build_error_response(None, "34020000001320000001")).unwrap();
        assert_eq!(cmd.sn, "");
        assert_eq!(cmd.device_id, "34020000001320000001");

        let xml = build_error_response(Some("77"), "34020000001320000001");
        assert!(xml.contains("<SN>77</SN>"));
        assert!(xml.contains("<Result>ERROR</Result>"));
    }
}
