// MANSCDP 命令解码
// 只扫描根元素的直接子元素，同名字段以第一次出现为准

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::{AgentError, Result};

/// 命令类型（CmdType）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Catalog,
    DeviceInfo,
    DeviceStatus,
    DeviceControl,
    Unknown(String),
}

impl CommandKind {
    fn from_cmd_type(cmd_type: &str) -> Self {
        match cmd_type {
            "Catalog" => CommandKind::Catalog,
            "DeviceInfo" => CommandKind::DeviceInfo,
            "DeviceStatus" => CommandKind::DeviceStatus,
            "DeviceControl" => CommandKind::DeviceControl,
            other => CommandKind::Unknown(other.to_string()),
        }
    }
}

/// 一条入站 MESSAGE 解码后的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    /// 根元素名（Query / Control / Notify / Response）
    pub root: String,
    pub kind: CommandKind,
    /// 序列号，原样回填到应答
    pub sn: String,
    pub device_id: String,
    /// PTZ 指令（仅 DeviceControl）
    pub ptz_cmd: Option<String>,
}

#[derive(Default)]
struct Fields {
    cmd_type: Option<String>,
    sn: Option<String>,
    device_id: Option<String>,
    ptz_cmd: Option<String>,
}

impl Fields {
    fn capture(&mut self, name: &str, text: String) {
        let slot = match name {
            "CmdType" => &mut self.cmd_type,
            "SN" => &mut self.sn,
            "DeviceID" => &mut self.device_id,
            "PTZCmd" => &mut self.ptz_cmd,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(text);
        }
    }
}

/// 解码 MANSCDP XML 消息体
pub fn decode(xml: &str) -> Result<IncomingCommand> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut depth = 0usize;
    let mut root: Option<String> = None;
    let mut root_closed = false;
    let mut child: Option<(String, String)> = None;
    let mut fields = Fields::default();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AgentError::Parse(format!("XML error at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => {
                if root_closed {
                    return Err(AgentError::Parse("content after root element".to_string()));
                }
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                depth += 1;
                match depth {
                    1 => root = Some(name),
                    2 => child = Some((name, String::new())),
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if root_closed {
                    return Err(AgentError::Parse("content after root element".to_string()));
                }
                if depth == 0 {
                    root = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                    root_closed = true;
                }
            }
            Event::Text(t) => {
                if depth == 0 {
                    return Err(AgentError::Parse("text outside root element".to_string()));
                }
                if depth == 2 {
                    let text = t
                        .unescape()
                        .map_err(|e| AgentError::Parse(format!("bad escape: {}", e)))?;
                    if let Some((_, buf)) = child.as_mut() {
                        buf.push_str(&text);
                    }
                }
            }
            Event::CData(c) => {
                if depth == 2 {
                    if let Some((_, buf)) = child.as_mut() {
                        buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some((name, text)) = child.take() {
                        fields.capture(&name, text.trim().to_string());
                    }
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    root_closed = true;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let root = root.ok_or_else(|| AgentError::Parse("document has no root element".to_string()))?;
    if !root_closed {
        return Err(AgentError::Parse(format!("root element <{}> is not closed", root)));
    }

    Ok(IncomingCommand {
        root,
        kind: CommandKind::from_cmd_type(fields.cmd_type.as_deref().unwrap_or_default()),
        sn: fields.sn.unwrap_or_default(),
        device_id: fields.device_id.unwrap_or_default(),
        ptz_cmd: fields.ptz_cmd,
    })
}
