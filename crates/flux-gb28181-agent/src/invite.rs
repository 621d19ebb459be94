// 点播协商（INVITE / ACK / BYE）
// Negotiating → Active → Closed；失败时 Negotiating → Rejected

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::identity::DeviceIdentity;
use crate::media::{MediaPipeline, MediaTarget, MediaWorker};
use crate::session::{CallSession, CallState, SessionRegistry};
use crate::signaling::{Signaling, TransactionId};
use crate::sip::SdpSession;
use crate::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// 写入 SDP answer 的本机媒体地址
    pub local_ip: String,
    /// answer 的 m= 传输协议
    pub transport: String,
    /// 未收到 ACK 时自动拆除会话的时限（None 关闭）
    pub ack_timeout: Option<Duration>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            transport: "RTP/AVP".to_string(),
            ack_timeout: Some(Duration::from_secs(32)),
        }
    }
}

pub struct CallNegotiator {
    identity: Arc<DeviceIdentity>,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<dyn MediaPipeline>,
    signaling: Arc<dyn Signaling>,
    config: NegotiatorConfig,
}

impl CallNegotiator {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<dyn MediaPipeline>,
        signaling: Arc<dyn Signaling>,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            identity,
            registry,
            pipeline,
            signaling,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 处理 INVITE；只有信令发送失败才返回错误
    pub async fn handle_call_setup(
        self: &Arc<Self>,
        tx: &TransactionId,
        call_id: &str,
        sdp: Option<&str>,
    ) -> Result<CallState> {
        let offer = match sdp.map(str::parse::<SdpSession>) {
            Some(Ok(offer)) => offer,
            Some(Err(e)) => return self.reject(tx, call_id, 400, &e).await,
            None => {
                let e = AgentError::Negotiation("INVITE carries no SDP offer".to_string());
                return self.reject(tx, call_id, 400, &e).await;
            }
        };

        let remote = match offer.remote_endpoint() {
            Ok(remote) => remote,
            Err(e) => return self.reject(tx, call_id, 400, &e).await,
        };

        if self.registry.contains(call_id).await {
            let e = AgentError::SessionAlreadyExists(call_id.to_string());
            return self.reject(tx, call_id, 400, &e).await;
        }

        let ports = self.registry.ports().clone();
        let local_port = match ports.lease() {
            Ok(port) => port,
            Err(e) => return self.reject(tx, call_id, 503, &e).await,
        };

        let mut answer = SdpSession::new(&self.identity.device_id, "Play", &self.config.local_ip);
        answer.add_ps_video(local_port, &self.config.transport);
        answer.ssrc = offer.ssrc.clone();

        let worker = MediaWorker::start(
            self.pipeline.clone(),
            MediaTarget {
                call_id: call_id.to_string(),
                local_port,
                remote: remote.clone(),
                ssrc: offer.ssrc.clone(),
            },
        );
        let stopped = worker.token();
        let ended = worker.ended();
        let session = CallSession::new(call_id, remote.clone(), local_port, offer.ssrc.clone(), worker);

        if let Err(rejected) = self.registry.insert(session).await {
            let mut session = rejected.session;
            session.worker.stop().await;
            ports.release(local_port);
            return self.reject(tx, call_id, 400, &rejected.error).await;
        }

        if let Err(e) = self.signaling.answer(tx, answer.to_string()).await {
            if let Ok(session) = self.registry.remove(call_id).await {
                self.teardown(session).await;
            }
            return Err(e);
        }

        self.registry.set_state(call_id, CallState::Active).await;
        tracing::info!(
            target: "gb28181::agent",
            %call_id,
            %remote,
            port = local_port,
            ssrc = offer.ssrc.as_deref().unwrap_or(""),
            "Call accepted"
        );

        self.spawn_supervisor(call_id.to_string(), local_port, stopped, ended);

        Ok(CallState::Active)
    }

    pub async fn handle_ack(&self, call_id: &str) -> bool {
        let known = self.registry.mark_acknowledged(call_id).await;
        if known {
            tracing::info!(target: "gb28181::agent", %call_id, "Call acknowledged");
        } else {
            tracing::warn!(target: "gb28181::agent", %call_id, "ACK for unknown call");
        }
        known
    }

    /// 处理 BYE：未知 Call-ID 回复 481 并返回 UnknownCallId
    pub async fn handle_close(&self, tx: &TransactionId, call_id: &str) -> Result<CallState> {
        match self.registry.remove(call_id).await {
            Ok(session) => {
                self.teardown(session).await;
                self.signaling.reply(tx, 200, None).await?;
                Ok(CallState::Closed)
            }
            Err(e) => {
                self.signaling.reply(tx, 481, None).await?;
                Err(e)
            }
        }
    }

    /// 拆除仍未确认的会话
    pub async fn expire_unacknowledged(&self, call_id: &str) -> bool {
        match self.registry.stop_if(call_id, |s| !s.acknowledged).await {
            Some(session) => {
                tracing::warn!(target: "gb28181::agent", %call_id, "No ACK received, tearing down call");
                log_closed(&session);
                true
            }
            None => false,
        }
    }

    /// 推流任务自行退出（管线失败等）后拆除会话；端口用于确认仍是同一路会话
    pub async fn close_ended(&self, call_id: &str, local_port: u16) -> bool {
        match self.registry.stop_if(call_id, |s| s.local_port == local_port).await {
            Some(session) => {
                tracing::warn!(target: "gb28181::agent", %call_id, port = local_port, "Media worker exited, tearing down call");
                log_closed(&session);
                true
            }
            None => false,
        }
    }

    /// 每路会话一个监视任务：ACK 超时或推流任务自行退出时拆除会话，
    /// 会话被正常停止（BYE、stop_all）后立即结束
    fn spawn_supervisor(
        self: &Arc<Self>,
        call_id: String,
        local_port: u16,
        stopped: CancellationToken,
        ended: CancellationToken,
    ) {
        let negotiator = Arc::clone(self);
        let ack_timeout = self.config.ack_timeout;
        let span = tracing::debug_span!("gb28181.agent.supervisor", %call_id, port = local_port);

        tokio::spawn(
            async move {
                let ack_deadline = async {
                    match ack_timeout {
                        Some(timeout) => tokio::time::sleep(timeout).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::pin!(ack_deadline);
                let mut ack_checked = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.cancelled() => break,
                        _ = ended.cancelled() => {
                            negotiator.close_ended(&call_id, local_port).await;
                            break;
                        }
                        _ = &mut ack_deadline, if !ack_checked => {
                            ack_checked = true;
                            if negotiator.expire_unacknowledged(&call_id).await {
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn teardown(&self, mut session: CallSession) {
        session.worker.stop().await;
        self.registry.ports().release(session.local_port);
        log_closed(&session);
    }

    async fn reject(&self, tx: &TransactionId, call_id: &str, status: u16, error: &AgentError) -> Result<CallState> {
        tracing::warn!(target: "gb28181::agent", %call_id, status, %error, "Call rejected");
        self.signaling.reply(tx, status, None).await?;
        Ok(CallState::Rejected)
    }
}

fn log_closed(session: &CallSession) {
    let lasted = Utc::now() - session.created_at;
    tracing::info!(
        target: "gb28181::agent",
        call_id = %session.call_id,
        port = session.local_port,
        seconds = lasted.num_seconds(),
        "Call closed"
    );
}
