// 设备侧 SIP/UDP 信令引擎
// 收包 → 解析 → 转成 SignalEvent；出站请求与事务回复走 Signaling

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::auth::DigestChallenge;
use super::message::{header_tag, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::identity::DeviceIdentity;
use crate::signaling::{SignalEvent, Signaling, TransactionId};
use crate::{AgentError, Result};

const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";
const SDP_CONTENT_TYPE: &str = "application/sdp";

/// 信令引擎配置
#[derive(Debug, Clone)]
pub struct SipEngineConfig {
    /// 监听地址
    pub bind_addr: String,

    /// 写入 Via / Contact 的本机地址
    pub local_ip: String,

    pub user_agent: String,

    /// 事件队列长度
    pub event_buffer: usize,
}

impl Default for SipEngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            local_ip: "127.0.0.1".to_string(),
            user_agent: format!("flux-gb28181-agent/{}", env!("CARGO_PKG_VERSION")),
            event_buffer: 256,
        }
    }
}

/// 正在进行的 REGISTER
#[derive(Debug, Clone, Copy, Default)]
struct RegisterAttempt {
    expires: u32,
    authorized: bool,
}

pub struct SipUdpEngine {
    config: SipEngineConfig,
    identity: Arc<DeviceIdentity>,
    socket: UdpSocket,
    local_port: u16,
    platform: SocketAddr,
    /// 注册对话的 Call-ID，续订时保持不变
    register_call_id: String,
    local_tag: String,
    cseq: AtomicU32,
    next_tx: AtomicU64,
    attempt: Mutex<RegisterAttempt>,
    /// 待回复的入站事务
    pending: DashMap<String, (SipRequest, SocketAddr)>,
    events: mpsc::Sender<SignalEvent>,
    cancel: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl SipUdpEngine {
    /// 绑定 UDP 并启动收包任务
    pub async fn bind(
        config: SipEngineConfig,
        identity: Arc<DeviceIdentity>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SignalEvent>)> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to bind UDP socket {}: {}", config.bind_addr, e)))?;
        let local_port = socket.local_addr()?.port();

        let platform = tokio::net::lookup_host((identity.platform_ip.as_str(), identity.platform_port))
            .await?
            .next()
            .ok_or_else(|| AgentError::Transport(format!("Cannot resolve platform {}", identity.platform_ip)))?;

        tracing::info!(
            target: "gb28181::sip",
            bind = %config.bind_addr,
            local_port,
            %platform,
            "SIP engine listening"
        );

        let (events, receiver) = mpsc::channel(config.event_buffer.max(1));
        let register_call_id = format!("{}@{}", random_token(), config.local_ip);

        let engine = Arc::new(Self {
            config,
            identity,
            socket,
            local_port,
            platform,
            register_call_id,
            local_tag: random_token(),
            cseq: AtomicU32::new(1),
            next_tx: AtomicU64::new(1),
            attempt: Mutex::new(RegisterAttempt::default()),
            pending: DashMap::new(),
            events,
            cancel: CancellationToken::new(),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&engine).recv_loop());
        *engine.recv_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok((engine, receiver))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn register_call_id(&self) -> &str {
        &self.register_call_id
    }

    /// 停止收包任务并等待退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.recv_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.pending.clear();
        tracing::info!(target: "gb28181::sip", "SIP engine stopped");
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => {
                        let span = tracing::info_span!("gb28181.sip.handle_message", remote = %addr, bytes = len);
                        if let Err(e) = self.handle_datagram(&buf[..len], addr).instrument(span).await {
                            tracing::warn!(target: "gb28181::sip", remote = %addr, error = %e, "Dropping SIP datagram");
                        }
                    }
                    Err(e) => {
                        tracing::error!(target: "gb28181::sip", error = %e, "Failed to receive UDP packet");
                    }
                },
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        // 保活用的空包
        if data.iter().all(|b| b.is_ascii_whitespace() || *b == 0) {
            return Ok(());
        }
        tracing::trace!(target: "gb28181::sip", "Received SIP message: {}", String::from_utf8_lossy(data));

        match SipMessage::from_bytes(data)? {
            SipMessage::Request(req) => self.handle_request(req, addr).await,
            SipMessage::Response(resp) => self.handle_response(resp).await,
        }
    }

    async fn handle_request(&self, req: SipRequest, addr: SocketAddr) -> Result<()> {
        let Some(call_id) = req.call_id().map(str::to_string) else {
            return self.send_response(&SipResponse::for_request(&req, 400), addr).await;
        };

        tracing::debug!(target: "gb28181::sip", method = %req.method, %call_id, "SIP request");

        let event = match req.method {
            SipMethod::Invite => {
                let sdp = req.body.clone();
                self.send_response(&self.response_for(&req, 100), addr).await?;
                let tx = self.track(req, addr);
                SignalEvent::CallSetupReceived { tx, call_id, sdp }
            }
            SipMethod::Ack => SignalEvent::CallAcknowledged { call_id },
            SipMethod::Bye => {
                let tx = self.track(req, addr);
                SignalEvent::CallClosed { tx, call_id }
            }
            SipMethod::Message => {
                let body = req.body.clone().unwrap_or_default();
                let tx = self.track(req, addr);
                SignalEvent::MessageReceived { tx, body }
            }
            SipMethod::Options | SipMethod::Cancel | SipMethod::Info => {
                return self.send_response(&self.response_for(&req, 200), addr).await;
            }
            SipMethod::Register => {
                return self.send_response(&self.response_for(&req, 405), addr).await;
            }
        };

        self.emit(event).await;
        Ok(())
    }

    async fn handle_response(&self, resp: SipResponse) -> Result<()> {
        let method = resp
            .headers
            .get("CSeq")
            .and_then(|v| v.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string();
        let call_id = resp.headers.get("Call-ID").unwrap_or_default();

        if method != "REGISTER" || call_id != self.register_call_id {
            if resp.status_code >= 300 {
                tracing::warn!(
                    target: "gb28181::sip",
                    %method,
                    status = resp.status_code,
                    reason = %resp.reason_phrase,
                    "Request rejected by platform"
                );
            }
            return Ok(());
        }

        let attempt = *self.attempt.lock().unwrap_or_else(|e| e.into_inner());

        match resp.status_code {
            100..=199 => Ok(()),
            200..=299 => {
                if attempt.expires == 0 {
                    tracing::info!(target: "gb28181::sip", "Unregistered");
                    return Ok(());
                }
                let expires = resp
                    .headers
                    .get("Expires")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .unwrap_or(attempt.expires);
                self.emit(SignalEvent::RegistrationSucceeded {
                    handle: self.register_call_id.clone(),
                    expires,
                })
                .await;
                Ok(())
            }
            401 | 407 if !attempt.authorized && self.identity.password.is_some() => {
                let header = if resp.status_code == 401 { "WWW-Authenticate" } else { "Proxy-Authenticate" };
                let challenge = resp.headers.get(header).and_then(DigestChallenge::parse);
                match challenge {
                    Some(challenge) => {
                        tracing::debug!(target: "gb28181::sip", realm = %challenge.realm, "REGISTER challenged");
                        self.send_register_request(attempt.expires, Some(&challenge)).await
                    }
                    None => {
                        self.emit_register_failure(&resp).await;
                        Ok(())
                    }
                }
            }
            _ => {
                self.emit_register_failure(&resp).await;
                Ok(())
            }
        }
    }

    async fn emit_register_failure(&self, resp: &SipResponse) {
        if self.attempt.lock().unwrap_or_else(|e| e.into_inner()).expires == 0 {
            tracing::warn!(target: "gb28181::sip", status = resp.status_code, "Unregister rejected");
            return;
        }
        self.emit(SignalEvent::RegistrationFailed {
            status: resp.status_code,
            reason: resp.reason_phrase.clone(),
        })
        .await;
    }

    async fn emit(&self, event: SignalEvent) {
        let kind = event.kind();
        if self.events.send(event).await.is_err() {
            tracing::debug!(target: "gb28181::sip", kind, "No event consumer, dropping event");
        }
    }

    /// 登记入站事务，返回其标识
    fn track(&self, req: SipRequest, addr: SocketAddr) -> TransactionId {
        let id = format!("tx-{}", self.next_tx.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(id.clone(), (req, addr));
        TransactionId(id)
    }

    /// 复制事务头部，To 缺 tag 时补上本端 tag
    fn response_for(&self, req: &SipRequest, status: u16) -> SipResponse {
        let mut resp = SipResponse::for_request(req, status);
        if let Some(to) = resp.headers.get("To").map(str::to_string) {
            if header_tag(&to).is_none() {
                resp.headers.set("To", format!("{};tag={}", to, self.local_tag));
            }
        }
        resp.headers.push("User-Agent", self.config.user_agent.clone());
        resp
    }

    async fn send_response(&self, resp: &SipResponse, addr: SocketAddr) -> Result<()> {
        self.send_to(&resp.to_string(), addr).await?;
        tracing::debug!(target: "gb28181::sip", status = resp.status_code, remote = %addr, "SIP response sent");
        Ok(())
    }

    async fn send_to(&self, text: &str, addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(text.as_bytes(), addr)
            .await
            .map_err(|e| AgentError::Transport(format!("Send to {} failed: {}", addr, e)))?;
        Ok(())
    }

    fn take_pending(&self, tx: &TransactionId) -> Result<(SipRequest, SocketAddr)> {
        self.pending
            .remove(&tx.0)
            .map(|(_, entry)| entry)
            .ok_or_else(|| AgentError::Transport(format!("Unknown transaction {}", tx)))
    }

    fn new_request(&self, method: SipMethod, uri: String, to: String, call_id: &str) -> SipRequest {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        let mut req = SipRequest::new(method, uri);
        req.add_header(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};rport;branch=z9hG4bK{}",
                self.config.local_ip,
                self.local_port,
                random_token()
            ),
        );
        req.add_header("From", format!("<{}>;tag={}", self.identity.device_uri(), self.local_tag));
        req.add_header("To", format!("<{}>", to));
        req.add_header("Call-ID", call_id);
        req.add_header("CSeq", format!("{} {}", cseq, method));
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", self.config.user_agent.clone());
        req
    }

    async fn send_register_request(&self, expires: u32, challenge: Option<&DigestChallenge>) -> Result<()> {
        let uri = format!("sip:{}@{}", self.identity.platform_id, self.identity.realm);
        let mut req = self.new_request(
            SipMethod::Register,
            uri.clone(),
            self.identity.device_uri(),
            &self.register_call_id,
        );
        req.add_header(
            "Contact",
            format!("<sip:{}@{}:{}>", self.identity.device_id, self.config.local_ip, self.local_port),
        );
        req.add_header("Expires", expires.to_string());

        if let (Some(challenge), Some(password)) = (challenge, self.identity.password.as_deref()) {
            let value = challenge.authorization(&self.identity.device_id, password, "REGISTER", &uri);
            req.add_header("Authorization", value);
        }

        *self.attempt.lock().unwrap_or_else(|e| e.into_inner()) = RegisterAttempt {
            expires,
            authorized: challenge.is_some(),
        };

        self.send_to(&req.to_string(), self.platform).await?;
        tracing::info!(
            target: "gb28181::sip",
            expires,
            authorized = challenge.is_some(),
            platform = %self.platform,
            "REGISTER sent"
        );
        Ok(())
    }
}

#[async_trait]
impl Signaling for SipUdpEngine {
    async fn send_register(&self, expires: u32) -> Result<()> {
        self.send_register_request(expires, None).await
    }

    async fn send_message(&self, body: String) -> Result<()> {
        let call_id = format!("{}@{}", random_token(), self.config.local_ip);
        let mut req = self.new_request(
            SipMethod::Message,
            self.identity.platform_uri(),
            self.identity.platform_uri(),
            &call_id,
        );
        req.set_body(MANSCDP_CONTENT_TYPE, body);
        self.send_to(&req.to_string(), self.platform).await
    }

    async fn reply(&self, tx: &TransactionId, status: u16, body: Option<String>) -> Result<()> {
        let (req, addr) = self.take_pending(tx)?;
        let mut resp = self.response_for(&req, status);
        if let Some(body) = body {
            resp.set_body(MANSCDP_CONTENT_TYPE, body);
        }
        self.send_response(&resp, addr).await
    }

    async fn answer(&self, tx: &TransactionId, sdp: String) -> Result<()> {
        let (req, addr) = self.take_pending(tx)?;
        let mut resp = self.response_for(&req, 200);
        resp.headers.push(
            "Contact",
            format!("<sip:{}@{}:{}>", self.identity.device_id, self.config.local_ip, self.local_port),
        );
        resp.set_body(SDP_CONTENT_TYPE, sdp);
        self.send_response(&resp, addr).await
    }
}

fn random_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Platform {
        socket: UdpSocket,
    }

    impl Platform {
        async fn recv(&self) -> (String, SocketAddr) {
            let mut buf = vec![0u8; 65536];
            let (len, addr) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            (String::from_utf8_lossy(&buf[..len]).into_owned(), addr)
        }

        async fn recv_request(&self) -> (SipRequest, SocketAddr) {
            let (text, addr) = self.recv().await;
            (text.parse().unwrap(), addr)
        }

        async fn send(&self, text: &str, addr: SocketAddr) {
            self.socket.send_to(text.as_bytes(), addr).await.unwrap();
        }
    }

    async fn setup(password: Option<&str>) -> (Platform, Arc<SipUdpEngine>, mpsc::Receiver<SignalEvent>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let platform_port = socket.local_addr().unwrap().port();

        let identity = Arc::new(DeviceIdentity {
            device_id: "34020000001320000001".to_string(),
            realm: "3402000000".to_string(),
            platform_id: "34020000002000000001".to_string(),
            platform_ip: "127.0.0.1".to_string(),
            platform_port,
            password: password.map(str::to_string),
        });
        let config = SipEngineConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let (engine, events) = SipUdpEngine::bind(config, identity).await.unwrap();
        (Platform { socket }, engine, events)
    }

    fn reply_to(req: &SipRequest, status: u16, extra: &str) -> String {
        let mut resp = SipResponse::for_request(req, status);
        for line in extra.lines().filter(|l| !l.is_empty()) {
            let (k, v) = line.split_once(':').unwrap();
            resp.headers.push(k.trim(), v.trim());
        }
        resp.to_string()
    }

    async fn next_event(events: &mut mpsc::Receiver<SignalEvent>) -> SignalEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_with_digest_challenge() {
        let (platform, engine, mut events) = setup(Some("12345678")).await;

        engine.send_register(3600).await.unwrap();
        let (first, addr) = platform.recv_request().await;
        assert_eq!(first.method, SipMethod::Register);
        assert_eq!(first.headers.get("Expires"), Some("3600"));
        assert!(first.headers.get("Authorization").is_none());

        let challenge = "WWW-Authenticate: Digest realm=\"3402000000\", nonce=\"abc123\"";
        platform.send(&reply_to(&first, 401, challenge), addr).await;

        let (second, addr) = platform.recv_request().await;
        let auth = second.headers.get("Authorization").unwrap();
        assert!(auth.contains("nonce=\"abc123\""));
        assert!(auth.contains("username=\"34020000001320000001\""));
        assert_eq!(second.call_id(), first.call_id());
        assert_ne!(second.headers.get("CSeq"), first.headers.get("CSeq"));

        platform.send(&reply_to(&second, 200, "Expires: 1800"), addr).await;

        match next_event(&mut events).await {
            SignalEvent::RegistrationSucceeded { handle, expires } => {
                assert_eq!(handle, engine.register_call_id());
                assert_eq!(expires, 1800);
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let (platform, engine, mut events) = setup(None).await;

        engine.send_register(3600).await.unwrap();
        let (req, addr) = platform.recv_request().await;
        platform.send(&reply_to(&req, 403, ""), addr).await;

        match next_event(&mut events).await {
            SignalEvent::RegistrationFailed { status, .. } => assert_eq!(status, 403),
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_message_and_reply() {
        let (platform, engine, mut events) = setup(None).await;
        let engine_addr: SocketAddr = format!("127.0.0.1:{}", engine.local_port()).parse().unwrap();

        let body = "<Query><CmdType>Catalog</CmdType><SN>17</SN></Query>";
        let request = format!(
            "MESSAGE sip:34020000001320000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKq1\r\n\
From: <sip:34020000002000000001@3402000000>;tag=p1\r\n\
To: <sip:34020000001320000001@3402000000>\r\n\
Call-ID: q-1@127.0.0.1\r\n\
CSeq: 20 MESSAGE\r\n\
Content-Type: Application/MANSCDP+xml\r\n\
Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        platform.send(&request, engine_addr).await;

        let tx = match next_event(&mut events).await {
            SignalEvent::MessageReceived { tx, body: received } => {
                assert_eq!(received, body);
                tx
            }
            other => panic!("unexpected {:?}", other),
        };

        engine.reply(&tx, 200, None).await.unwrap();
        let (text, _) = platform.recv().await;
        let resp: SipResponse = text.parse().unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.headers.get("Call-ID"), Some("q-1@127.0.0.1"));
        assert_eq!(resp.headers.get("CSeq"), Some("20 MESSAGE"));
        assert!(header_tag(resp.headers.get("To").unwrap()).is_some());

        // 同一事务只能回复一次
        assert!(matches!(engine.reply(&tx, 200, None).await, Err(AgentError::Transport(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_outbound_message() {
        let (platform, engine, _events) = setup(None).await;

        engine.send_message("<Notify/>".to_string()).await.unwrap();

        let (req, _) = platform.recv_request().await;
        assert_eq!(req.method, SipMethod::Message);
        assert_eq!(req.uri, "sip:34020000002000000001@3402000000");
        assert_eq!(req.headers.get("content-type"), Some(MANSCDP_CONTENT_TYPE));
        assert_eq!(req.body.as_deref(), Some("<Notify/>"));
        engine.shutdown().await;
    }
}
