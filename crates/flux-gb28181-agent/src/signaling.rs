// 信令引擎边界
// 核心只通过 Signaling 发送，通过 SignalEvent 接收

use async_trait::async_trait;

use crate::Result;

/// 入站事务的不透明标识，由信令引擎分配，用于回复
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 信令引擎上报的事件
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// REGISTER 成功，handle 为注册对话的 Call-ID
    RegistrationSucceeded { handle: String, expires: u32 },
    RegistrationFailed { status: u16, reason: String },
    /// 平台下发的 MESSAGE（MANSCDP XML）
    MessageReceived { tx: TransactionId, body: String },
    /// 平台下发的 INVITE
    CallSetupReceived {
        tx: TransactionId,
        call_id: String,
        sdp: Option<String>,
    },
    CallAcknowledged { call_id: String },
    /// 平台下发的 BYE
    CallClosed { tx: TransactionId, call_id: String },
}

impl SignalEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEvent::RegistrationSucceeded { .. } => "registration_succeeded",
            SignalEvent::RegistrationFailed { .. } => "registration_failed",
            SignalEvent::MessageReceived { .. } => "message",
            SignalEvent::CallSetupReceived { .. } => "call_setup",
            SignalEvent::CallAcknowledged { .. } => "call_ack",
            SignalEvent::CallClosed { .. } => "call_closed",
        }
    }
}

/// 核心对信令引擎的全部出站调用
#[async_trait]
pub trait Signaling: Send + Sync {
    /// 发送 REGISTER；expires 为 0 表示注销
    async fn send_register(&self, expires: u32) -> Result<()>;

    /// 向平台发送 MANSCDP MESSAGE（心跳、查询应答等）
    async fn send_message(&self, body: String) -> Result<()>;

    /// 回复入站事务；body 为 MANSCDP XML
    async fn reply(&self, tx: &TransactionId, status: u16, body: Option<String>) -> Result<()>;

    /// 以 200 OK + SDP answer 回复 INVITE
    async fn answer(&self, tx: &TransactionId, sdp: String) -> Result<()>;
}
