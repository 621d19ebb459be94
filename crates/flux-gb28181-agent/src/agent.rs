// 设备代理：组装各组件，分发信令事件，按顺序停止

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::identity::{DeviceIdentity, DeviceProfile};
use crate::invite::{CallNegotiator, NegotiatorConfig};
use crate::manscdp::{ChannelDirectory, CommandHandler, PtzController};
use crate::media::{MediaPipeline, PortAllocator};
use crate::register::{RegistrationConfig, RegistrationManager, RegistrationOutcome};
use crate::session::SessionRegistry;
use crate::signaling::{SignalEvent, Signaling};
use crate::{AgentError, Result};

/// 代理运行参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub registration: RegistrationConfig,
    pub negotiator: NegotiatorConfig,
    /// RTP 端口范围（闭区间）
    pub port_start: u16,
    pub port_end: u16,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            registration: RegistrationConfig::default(),
            negotiator: NegotiatorConfig::default(),
            port_start: 30000,
            port_end: 30100,
        }
    }
}

/// 代理的外部依赖
pub struct AgentDeps {
    pub signaling: Arc<dyn Signaling>,
    pub pipeline: Arc<dyn MediaPipeline>,
    pub directory: Arc<dyn ChannelDirectory>,
    pub ptz: Arc<dyn PtzController>,
}

type Worker = (CancellationToken, JoinHandle<()>);

#[derive(Default)]
struct Workers {
    event: Option<Worker>,
    registration: Option<Worker>,
}

pub struct Agent {
    identity: Arc<DeviceIdentity>,
    registration: Arc<RegistrationManager>,
    negotiator: Arc<CallNegotiator>,
    commands: CommandHandler,
    registry: Arc<SessionRegistry>,
    workers: Mutex<Workers>,
}

impl Agent {
    pub fn new(identity: DeviceIdentity, profile: DeviceProfile, settings: AgentSettings, deps: AgentDeps) -> Result<Self> {
        let identity = Arc::new(identity);
        let ports = Arc::new(PortAllocator::new(settings.port_start, settings.port_end)?);
        let registry = Arc::new(SessionRegistry::new(ports));

        let registration = Arc::new(RegistrationManager::new(
            identity.clone(),
            deps.signaling.clone(),
            settings.registration,
        ));
        let negotiator = Arc::new(CallNegotiator::new(
            identity.clone(),
            registry.clone(),
            deps.pipeline,
            deps.signaling.clone(),
            settings.negotiator,
        ));
        let commands = CommandHandler::new(identity.clone(), profile, deps.directory, deps.ptz, deps.signaling);

        Ok(Self {
            identity,
            registration,
            negotiator,
            commands,
            registry,
            workers: Mutex::new(Workers::default()),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn registration(&self) -> &Arc<RegistrationManager> {
        &self.registration
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 启动：先开事件循环，再注册；注册失败则停掉事件循环并返回错误
    pub async fn start(self: &Arc<Self>, events: mpsc::Receiver<SignalEvent>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.event.is_some() {
            return Err(AgentError::Other("agent already started".to_string()));
        }

        let event_token = CancellationToken::new();
        let event_task = {
            let agent = Arc::clone(self);
            let token = event_token.clone();
            tokio::spawn(async move { agent.event_loop(events, token).await })
        };

        if let Err(e) = self.registration.register().await {
            tracing::error!(target: "gb28181::agent", error = %e, "Initial registration failed");
            event_token.cancel();
            if let Err(e) = event_task.await {
                tracing::warn!(target: "gb28181::agent", worker = "event", error = %e, "Worker panicked");
            }
            self.registration.stop().await;
            return Err(e);
        }

        let registration_token = CancellationToken::new();
        let registration_task = {
            let registration = self.registration.clone();
            let token = registration_token.clone();
            tokio::spawn(async move { registration.run(token).await })
        };

        workers.event = Some((event_token, event_task));
        workers.registration = Some((registration_token, registration_task));

        tracing::info!(
            target: "gb28181::agent",
            device_id = %self.identity.device_id,
            "Agent started"
        );
        Ok(())
    }

    /// 停止：事件循环 → 注册任务（可选注销）→ 全部会话；重复调用无副作用
    pub async fn stop(&self) {
        let (event, registration) = {
            let mut workers = self.workers.lock().await;
            (workers.event.take(), workers.registration.take())
        };
        let was_running = event.is_some();

        for (name, worker) in [("event", event), ("registration", registration)] {
            if let Some((token, task)) = worker {
                token.cancel();
                if let Err(e) = task.await {
                    tracing::warn!(target: "gb28181::agent", worker = name, error = %e, "Worker panicked");
                }
            }
        }

        self.registration.stop().await;
        let sessions = self.registry.stop_all().await;

        if was_running {
            tracing::info!(target: "gb28181::agent", sessions, "Agent stopped");
        }
    }

    async fn event_loop(&self, mut events: mpsc::Receiver<SignalEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        tracing::warn!(target: "gb28181::agent", "Signalling event channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// 分发一个信令事件；错误只记录，不向上传播
    pub async fn dispatch(&self, event: SignalEvent) {
        let span = tracing::info_span!("gb28181.agent.dispatch", kind = event.kind());
        self.route(event).instrument(span).await
    }

    async fn route(&self, event: SignalEvent) {
        match event {
            SignalEvent::RegistrationSucceeded { handle, expires } => {
                self.registration.on_outcome(RegistrationOutcome::Succeeded { handle, expires });
            }
            SignalEvent::RegistrationFailed { status, reason } => {
                self.registration.on_outcome(RegistrationOutcome::Failed { status, reason });
            }
            SignalEvent::MessageReceived { tx, body } => match self.commands.handle(&tx, &body).await {
                Ok(outcome) => tracing::debug!(target: "gb28181::agent", %tx, ?outcome, "Command handled"),
                Err(e) => tracing::error!(target: "gb28181::agent", %tx, error = %e, "Command handling failed"),
            },
            SignalEvent::CallSetupReceived { tx, call_id, sdp } => {
                if let Err(e) = self.negotiator.handle_call_setup(&tx, &call_id, sdp.as_deref()).await {
                    tracing::error!(target: "gb28181::agent", %call_id, error = %e, "Call setup failed");
                }
            }
            SignalEvent::CallAcknowledged { call_id } => {
                self.negotiator.handle_ack(&call_id).await;
            }
            SignalEvent::CallClosed { tx, call_id } => {
                if let Err(e) = self.negotiator.handle_close(&tx, &call_id).await {
                    tracing::error!(target: "gb28181::agent", %call_id, error = %e, "Call teardown failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manscdp::{LoggingPtzController, StaticChannelDirectory};
    use crate::register::RegistrationPhase;
    use crate::signaling::TransactionId;
    use crate::testing::{CountingPipeline, RecordingSignaling, Sent};
    use std::time::Duration;

    fn agent(signaling: Arc<RecordingSignaling>) -> Arc<Agent> {
        let identity = DeviceIdentity {
            device_id: "34020000001320000001".to_string(),
            realm: "3402000000".to_string(),
            platform_id: "34020000002000000001".to_string(),
            platform_ip: "127.0.0.1".to_string(),
            platform_port: 5060,
            password: None,
        };
        let settings = AgentSettings {
            registration: RegistrationConfig {
                register_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        };
        let deps = AgentDeps {
            signaling,
            pipeline: Arc::new(CountingPipeline::default()),
            directory: Arc::new(StaticChannelDirectory::numbered("34020000001320000001", 1, "Camera", "")),
            ptz: Arc::new(LoggingPtzController),
        };
        Arc::new(Agent::new(identity, DeviceProfile::default(), settings, deps).unwrap())
    }

    #[tokio::test]
    async fn test_start_fails_when_registration_rejected() {
        let signaling = Arc::new(RecordingSignaling::default());
        let agent = agent(signaling);
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx
            .send(SignalEvent::RegistrationFailed {
                status: 403,
                reason: "Forbidden".to_string(),
            })
            .await
            .unwrap();

        let result = agent.start(events_rx).await;

        assert!(matches!(result, Err(AgentError::Registration(_))));
        assert_eq!(agent.registration().phase().await, RegistrationPhase::Unregistered);
        // 事件循环已退出，接收端被释放
        assert!(events_tx.is_closed());
    }

    #[tokio::test]
    async fn test_start_and_stop_twice() {
        let signaling = Arc::new(RecordingSignaling::default());
        let agent = agent(signaling.clone());
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx
            .send(SignalEvent::RegistrationSucceeded {
                handle: "reg".to_string(),
                expires: 3600,
            })
            .await
            .unwrap();
        agent.start(events_rx).await.unwrap();
        assert_eq!(agent.registration().phase().await, RegistrationPhase::Registered);

        let (_, again) = mpsc::channel(1);
        assert!(agent.start(again).await.is_err());

        agent.stop().await;
        agent.stop().await;

        assert!(events_tx.is_closed());
        let registers: Vec<Sent> = signaling
            .sent()
            .into_iter()
            .filter(|s| matches!(s, Sent::Register(_)))
            .collect();
        assert_eq!(registers, vec![Sent::Register(3600), Sent::Register(0)]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_bye() {
        let signaling = Arc::new(RecordingSignaling::default());
        let agent = agent(signaling.clone());

        agent
            .dispatch(SignalEvent::CallClosed {
                tx: TransactionId("t9".to_string()),
                call_id: "ghost".to_string(),
            })
            .await;

        assert_eq!(signaling.sent(), vec![Sent::Reply { tx: "t9".to_string(), status: 481, body: None }]);
        assert!(agent.registry().is_empty().await);
    }
}
