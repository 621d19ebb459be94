// 注册与心跳
// 启动时注册；过期前续订；周期发送 Keepalive

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::identity::DeviceIdentity;
use crate::manscdp::build_keepalive;
use crate::signaling::Signaling;
use crate::{AgentError, Result};

/// 注册参数
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// 申请的有效期（秒）
    pub expires: u32,
    /// 等待 REGISTER 结果的时限
    pub register_timeout: Duration,
    /// 续订失败后的重试间隔
    pub retry_interval: Duration,
    /// 心跳间隔
    pub keepalive_interval: Duration,
    /// 停止时发送 Expires: 0
    pub unregister_on_stop: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            register_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            unregister_on_stop: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    Unregistered,
    Registering,
    Registered,
    RegistrationFailed,
}

#[derive(Debug, Clone)]
pub struct RegistrationState {
    pub phase: RegistrationPhase,
    /// 注册对话的 Call-ID
    pub handle: Option<String>,
    /// 平台批准的有效期（秒）
    pub expires: u32,
    pub last_renewed: Option<DateTime<Utc>>,
}

impl Default for RegistrationState {
    fn default() -> Self {
        Self {
            phase: RegistrationPhase::Unregistered,
            handle: None,
            expires: 0,
            last_renewed: None,
        }
    }
}

/// REGISTER 的结果（由信令事件转换而来）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Succeeded { handle: String, expires: u32 },
    Failed { status: u16, reason: String },
}

/// Keepalive 序号，从 1 开始单调递增
#[derive(Debug, Default)]
pub struct KeepAliveCounter(AtomicU64);

impl KeepAliveCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 续订延迟：有效期的 3/4，不为零且严格小于有效期
pub fn renewal_delay(expires: u32) -> Duration {
    let expires_ms = u64::from(expires.max(1)) * 1000;
    Duration::from_millis(expires_ms * 3 / 4)
}

pub struct RegistrationManager {
    identity: Arc<DeviceIdentity>,
    signaling: Arc<dyn Signaling>,
    config: RegistrationConfig,
    state: RwLock<RegistrationState>,
    keepalive: KeepAliveCounter,
    outcome_tx: mpsc::Sender<RegistrationOutcome>,
    outcome_rx: Mutex<mpsc::Receiver<RegistrationOutcome>>,
}

impl RegistrationManager {
    pub fn new(identity: Arc<DeviceIdentity>, signaling: Arc<dyn Signaling>, config: RegistrationConfig) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(16);
        Self {
            identity,
            signaling,
            config,
            state: RwLock::new(RegistrationState::default()),
            keepalive: KeepAliveCounter::default(),
            outcome_tx,
            outcome_rx: Mutex::new(outcome_rx),
        }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub async fn state(&self) -> RegistrationState {
        self.state.read().await.clone()
    }

    pub async fn phase(&self) -> RegistrationPhase {
        self.state.read().await.phase
    }

    /// 事件循环收到注册结果后转交到这里，不阻塞调用方
    pub fn on_outcome(&self, outcome: RegistrationOutcome) {
        if let Err(e) = self.outcome_tx.try_send(outcome) {
            tracing::warn!(target: "gb28181::agent", error = %e, "Dropping registration outcome");
        }
    }

    /// 启动注册：发送 REGISTER 并等待结果，失败或超时即为启动失败
    pub async fn register(&self) -> Result<()> {
        let mut outcomes = self.outcome_rx.lock().await;
        self.set_phase(RegistrationPhase::Registering).await;

        tracing::info!(
            target: "gb28181::agent",
            device_id = %self.identity.device_id,
            platform = %self.identity.platform_uri(),
            expires = self.config.expires,
            "Registering"
        );

        if let Err(e) = self.signaling.send_register(self.config.expires).await {
            self.set_phase(RegistrationPhase::RegistrationFailed).await;
            return Err(AgentError::Registration(format!("send REGISTER failed: {}", e)));
        }

        match tokio::time::timeout(self.config.register_timeout, outcomes.recv()).await {
            Ok(Some(outcome)) => self.apply_outcome(outcome).await.map(|_| ()),
            Ok(None) => {
                self.set_phase(RegistrationPhase::RegistrationFailed).await;
                Err(AgentError::Registration("outcome channel closed".to_string()))
            }
            Err(_) => {
                self.set_phase(RegistrationPhase::RegistrationFailed).await;
                Err(AgentError::Registration(format!(
                    "no response within {:?}",
                    self.config.register_timeout
                )))
            }
        }
    }

    /// 续订与心跳任务，直到 cancel 被触发
    pub async fn run(&self, cancel: CancellationToken) {
        let mut outcomes = self.outcome_rx.lock().await;

        let interval = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);

        let granted = self.state.read().await.expires;
        let mut deadline = Instant::now() + renewal_delay(if granted > 0 { granted } else { self.config.expires });
        // 已发出续订、正在等待结果
        let mut pending = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = keepalive.tick() => self.send_keepalive().await,
                _ = tokio::time::sleep_until(deadline) => {
                    if pending {
                        pending = false;
                        self.set_phase(RegistrationPhase::RegistrationFailed).await;
                        tracing::warn!(target: "gb28181::agent", "Registration renewal timed out, retrying");
                        deadline = Instant::now() + self.config.retry_interval;
                        continue;
                    }

                    // 定时续订期间仍处于 Registered；只有失败后的重试回到 Registering
                    if self.phase().await != RegistrationPhase::Registered {
                        self.set_phase(RegistrationPhase::Registering).await;
                    }
                    match self.signaling.send_register(self.config.expires).await {
                        Ok(()) => {
                            pending = true;
                            deadline = Instant::now() + self.config.register_timeout;
                        }
                        Err(e) => {
                            self.set_phase(RegistrationPhase::RegistrationFailed).await;
                            tracing::warn!(target: "gb28181::agent", error = %e, "Registration renewal failed, retrying");
                            deadline = Instant::now() + self.config.retry_interval;
                        }
                    }
                }
                outcome = outcomes.recv() => {
                    let Some(outcome) = outcome else { break };
                    pending = false;
                    deadline = match self.apply_outcome(outcome).await {
                        Ok(expires) => Instant::now() + renewal_delay(expires),
                        Err(e) => {
                            tracing::warn!(target: "gb28181::agent", error = %e, "Registration renewal rejected, retrying");
                            Instant::now() + self.config.retry_interval
                        }
                    };
                }
            }
        }

        tracing::debug!(target: "gb28181::agent", "Registration worker stopped");
    }

    /// 停止：按配置注销，然后回到 Unregistered
    pub async fn stop(&self) {
        if self.config.unregister_on_stop && self.phase().await == RegistrationPhase::Registered {
            self.unregister().await;
        }
        *self.state.write().await = RegistrationState::default();
    }

    /// 尽力发送 Expires: 0
    pub async fn unregister(&self) {
        match self.signaling.send_register(0).await {
            Ok(()) => tracing::info!(target: "gb28181::agent", "Unregister sent"),
            Err(e) => tracing::warn!(target: "gb28181::agent", error = %e, "Unregister failed"),
        }
    }

    async fn send_keepalive(&self) {
        let sn = self.keepalive.next();
        let body = build_keepalive(sn, &self.identity.device_id);
        match self.signaling.send_message(body).await {
            Ok(()) => tracing::debug!(target: "gb28181::agent", sn, "Keepalive sent"),
            Err(e) => tracing::warn!(target: "gb28181::agent", sn, error = %e, "Keepalive failed"),
        }
    }

    async fn apply_outcome(&self, outcome: RegistrationOutcome) -> Result<u32> {
        let mut state = self.state.write().await;
        match outcome {
            RegistrationOutcome::Succeeded { handle, expires } => {
                tracing::info!(target: "gb28181::agent", %handle, expires, "Registered");
                state.phase = RegistrationPhase::Registered;
                state.handle = Some(handle);
                state.expires = expires;
                state.last_renewed = Some(Utc::now());
                Ok(expires)
            }
            RegistrationOutcome::Failed { status, reason } => {
                state.phase = RegistrationPhase::RegistrationFailed;
                Err(AgentError::Registration(format!("{} {}", status, reason)))
            }
        }
    }

    async fn set_phase(&self, phase: RegistrationPhase) {
        self.state.write().await.phase = phase;
    }
}
