// GB28181 SDP 会话描述
// 解析平台 INVITE 中的 offer，生成设备侧 answer

use std::fmt;
use std::str::FromStr;

use crate::{AgentError, Result};

/// SDP 连接信息（c= 行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    pub fn ip4(address: impl Into<String>) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.into(),
        }
    }
}

/// RTP 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    /// 编码名称（PS/H264/MPEG4）
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// SDP 媒体描述（m= 行及其属性）
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    /// 传输协议（RTP/AVP 或 TCP/RTP/AVP）
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,
    /// 媒体级 c= 行，优先于会话级
    pub connection: Option<SdpConnection>,
    pub attributes: Vec<String>,
}

/// SDP 会话描述
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub origin_user: String,
    /// s= 行，Play / Playback / Download
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    /// GB28181 扩展 y= 行（SSRC，十位十进制）
    pub ssrc: Option<String>,
    pub media: Vec<SdpMedia>,
}

/// 从 offer 中解析出的远端媒体目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for MediaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl SdpSession {
    pub fn new(origin_user: impl Into<String>, session_name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            origin_user: origin_user.into(),
            session_name: session_name.into(),
            connection: Some(SdpConnection::ip4(ip)),
            ssrc: None,
            media: Vec::new(),
        }
    }

    /// 添加设备侧发送的 PS 视频流
    pub fn add_ps_video(&mut self, port: u16, protocol: impl Into<String>) {
        self.media.push(SdpMedia {
            media_type: "video".to_string(),
            port,
            protocol: protocol.into(),
            formats: vec![96],
            rtpmap: vec![RtpMap {
                payload_type: 96,
                encoding_name: "PS".to_string(),
                clock_rate: 90000,
            }],
            connection: None,
            attributes: vec!["sendonly".to_string()],
        });
    }

    /// 提取可用的远端媒体目标：需要地址和非零端口
    pub fn remote_endpoint(&self) -> Result<MediaEndpoint> {
        let media = self
            .media
            .iter()
            .find(|m| m.port != 0)
            .ok_or_else(|| AgentError::Negotiation("offer has no media line with a usable port".to_string()))?;

        let address = media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .map(|c| c.address.trim())
            .filter(|a| !a.is_empty() && *a != "0.0.0.0")
            .ok_or_else(|| AgentError::Negotiation("offer has no connection address".to_string()))?;

        Ok(MediaEndpoint {
            address: address.to_string(),
            port: media.port,
        })
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;

        let (net, addr_type, addr) = match &self.connection {
            Some(c) => (c.network_type.as_str(), c.address_type.as_str(), c.address.as_str()),
            None => ("IN", "IP4", "0.0.0.0"),
        };
        write!(f, "o={} 0 0 {} {} {}\r\n", self.origin_user, net, addr_type, addr)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|p| p.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            if let Some(c) = &media.connection {
                write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
            }
            for map in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}/{}\r\n", map.payload_type, map.encoding_name, map.clock_rate)?;
            }
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }

        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }

        Ok(())
    }
}

impl FromStr for SdpSession {
    type Err = AgentError;

    fn from_str(sdp: &str) -> Result<Self> {
        let mut session = SdpSession {
            origin_user: String::new(),
            session_name: String::new(),
            connection: None,
            ssrc: None,
            media: Vec::new(),
        };

        let mut current: Option<SdpMedia> = None;

        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "o" => {
                    session.origin_user = value.split_whitespace().next().unwrap_or_default().to_string();
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            address: parts[2].to_string(),
                        };
                        match current.as_mut() {
                            Some(media) => media.connection = Some(conn),
                            None => session.connection = Some(conn),
                        }
                    }
                }
                "y" => session.ssrc = Some(value.trim().to_string()),
                "m" => {
                    if let Some(media) = current.take() {
                        session.media.push(media);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(AgentError::Parse(format!("Invalid media line: {}", line)));
                    }
                    current = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port: parts[1]
                            .split('/')
                            .next()
                            .and_then(|p| p.parse().ok())
                            .unwrap_or(0),
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                        rtpmap: Vec::new(),
                        connection: None,
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    let Some(media) = current.as_mut() else {
                        continue;
                    };
                    match value.strip_prefix("rtpmap:").and_then(parse_rtpmap) {
                        Some(map) => media.rtpmap.push(map),
                        None => media.attributes.push(value.to_string()),
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current {
            session.media.push(media);
        }

        Ok(session)
    }
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, rest) = value.split_once(' ')?;
    let mut enc = rest.split('/');
    Some(RtpMap {
        payload_type: pt.trim().parse().ok()?,
        encoding_name: enc.next()?.to_string(),
        clock_rate: enc.next().and_then(|r| r.parse().ok()).unwrap_or(90000),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
                         o=34020000002000000001 0 0 IN IP4 192.168.1.100\r\n\
                         s=Play\r\n\
                         c=IN IP4 192.168.1.100\r\n\
                         t=0 0\r\n\
                         m=video 30000 RTP/AVP 96 98 97\r\n\
                         a=recvonly\r\n\
                         a=rtpmap:96 PS/90000\r\n\
                         a=rtpmap:98 H264/90000\r\n\
                         y=0100000001\r\n";

    #[test]
    fn test_offer_parsing() {
        let offer: SdpSession = OFFER.parse().unwrap();

        assert_eq!(offer.session_name, "Play");
        assert_eq!(offer.ssrc.as_deref(), Some("0100000001"));
        assert_eq!(offer.media.len(), 1);
        assert_eq!(offer.media[0].formats, vec![96, 98, 97]);
        assert_eq!(offer.media[0].rtpmap[1].encoding_name, "H264");
        assert_eq!(offer.media[0].attributes, vec!["recvonly".to_string()]);

        let remote = offer.remote_endpoint().unwrap();
        assert_eq!(remote, MediaEndpoint { address: "192.168.1.100".to_string(), port: 30000 });
    }

    #[test]
    fn test_media_level_connection_wins() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 6000 RTP/AVP 96\r\nc=IN IP4 10.0.0.2\r\n";
        let offer: SdpSession = sdp.parse().unwrap();
        assert_eq!(offer.remote_endpoint().unwrap().address, "10.0.0.2");
    }

    #[test]
    fn test_offer_without_usable_port() {
        let zero_port: SdpSession = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 0 RTP/AVP 96\r\n".parse().unwrap();
        assert!(matches!(zero_port.remote_endpoint(), Err(AgentError::Negotiation(_))));

        let no_media: SdpSession = "v=0\r\nc=IN IP4 10.0.0.1\r\n".parse().unwrap();
        assert!(no_media.remote_endpoint().is_err());

        let no_addr: SdpSession = "v=0\r\nm=video 6000 RTP/AVP 96\r\n".parse().unwrap();
        assert!(no_addr.remote_endpoint().is_err());
    }

    #[test]
    fn test_answer_generation() {
        let mut answer = SdpSession::new("34020000001320000001", "Play", "192.168.1.64");
        answer.ssrc = Some("0100000001".to_string());
        answer.add_ps_video(15060, "RTP/AVP");

        let sdp = answer.to_string();

        assert!(sdp.contains("o=34020000001320000001 0 0 IN IP4 192.168.1.64\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.64\r\n"));
        assert!(sdp.contains("m=video 15060 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 PS/90000\r\n"));
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.ends_with("y=0100000001\r\n"));
    }
}
