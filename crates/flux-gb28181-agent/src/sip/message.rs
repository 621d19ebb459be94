// SIP 消息解析和生成
// 设备侧只需要 GB28181 用到的方法子集

use std::fmt;
use std::str::FromStr;

use crate::{AgentError, Result};

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
        };
        f.write_str(name)
    }
}

impl FromStr for SipMethod {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "MESSAGE" => Ok(SipMethod::Message),
            "OPTIONS" => Ok(SipMethod::Options),
            "INFO" => Ok(SipMethod::Info),
            other => Err(AgentError::Parse(format!("Unknown SIP method: {}", other))),
        }
    }
}

/// 有序头部列表，查找时忽略大小写
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 追加头部（允许重复，如多个 Via）
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换同名头部；不存在时追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::default(),
            body: None,
        }
    }

    pub fn add_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        write_tail(f, &self.headers, self.body.as_deref())
    }
}

impl FromStr for SipRequest {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(AgentError::Parse(format!("Invalid request line: {}", start_line)));
        }

        Ok(Self {
            method: parts[0].parse()?,
            uri: parts[1].to_string(),
            headers,
            body,
        })
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase(status_code).to_string(),
            headers: Headers::default(),
            body: None,
        }
    }

    /// 按 GB28181 设备侧惯例从请求复制事务相关头部
    pub fn for_request(req: &SipRequest, status_code: u16) -> Self {
        let mut resp = Self::new(status_code);
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for (name, value) in req.headers.iter() {
                if name.eq_ignore_ascii_case(key) {
                    resp.headers.push(key, value);
                }
            }
        }
        resp
    }

    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body);
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status_code, self.reason_phrase)?;
        write_tail(f, &self.headers, self.body.as_deref())
    }
}

impl FromStr for SipResponse {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let (status_line, headers, body) = split_message(s)?;

        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(AgentError::Parse(format!("Invalid status line: {}", status_line)));
        }

        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| AgentError::Parse(format!("Invalid status code: {}", parts[1])))?;

        Ok(Self {
            status_code,
            reason_phrase: parts.get(2).copied().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl FromStr for SipMessage {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(s.parse()?))
        } else {
            Ok(SipMessage::Request(s.parse()?))
        }
    }
}

impl SipMessage {
    /// 从 UDP 数据报解析：在原始字节上切分头部与消息体，Content-Length 按字节计算，
    /// 非 UTF-8 消息体（如 GB2312）不会因解码改变长度而被截断
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (head, raw_body) = match data.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => (&data[..pos], &data[pos + 4..]),
            None => (data, &data[data.len()..]),
        };

        let mut message: SipMessage = String::from_utf8_lossy(head).parse()?;

        let body = match message.headers().get("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
            Some(len) if len <= raw_body.len() => &raw_body[..len],
            _ => raw_body,
        };
        if !body.is_empty() {
            let body = String::from_utf8_lossy(body).into_owned();
            match &mut message {
                SipMessage::Request(req) => req.body = Some(body),
                SipMessage::Response(resp) => resp.body = Some(body),
            }
        }

        Ok(message)
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }
}

/// 常用状态码的原因短语
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// 从 From/To 头部提取 tag 参数
pub fn header_tag(value: &str) -> Option<&str> {
    value
        .split(';')
        .skip(1)
        .map(str::trim)
        .find_map(|param| param.strip_prefix("tag="))
}

fn write_tail(f: &mut fmt::Formatter<'_>, headers: &Headers, body: Option<&str>) -> fmt::Result {
    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", key, value)?;
    }

    let body = body.unwrap_or_default();
    write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
}

fn split_message(s: &str) -> Result<(&str, Headers, Option<String>)> {
    let (head, raw_body) = match s.find("\r\n\r\n") {
        Some(pos) => (&s[..pos], &s[pos + 4..]),
        None => (s.trim_end(), ""),
    };

    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| AgentError::Parse("Empty SIP message".to_string()))?;

    let mut headers = Headers::default();
    for line in lines {
        if let Some(pos) = line.find(':') {
            headers.push(line[..pos].trim(), line[pos + 1..].trim());
        }
    }

    // Content-Length 优先，UDP 数据报可能带尾部填充
    let body = match headers.get("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) if len <= raw_body.len() => raw_body.get(..len).unwrap_or(raw_body),
        _ => raw_body,
    };

    let body = if body.is_empty() { None } else { Some(body.to_string()) };

    Ok((start_line, headers, body))
}
