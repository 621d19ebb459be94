// MANSCDP 命令处理
// 解码 → 执行 → 回复事务 → 必要时向平台发送应答 MESSAGE

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use super::command::{decode, CommandKind, IncomingCommand};
use super::ptz::PtzCommand;
use super::response::{
    build_catalog_response, build_control_response, build_device_info_response,
    build_device_status_response, build_error_response, ChannelDirectory,
};
use crate::identity::{DeviceIdentity, DeviceProfile};
use crate::signaling::{Signaling, TransactionId};
use crate::{AgentError, Result};

/// 云台驱动（外部组件）
#[async_trait]
pub trait PtzController: Send + Sync {
    async fn apply(&self, target_id: &str, command: &PtzCommand) -> Result<()>;
}

/// 只记录日志的云台驱动，用于无云台设备
#[derive(Debug, Default)]
pub struct LoggingPtzController;

#[async_trait]
impl PtzController for LoggingPtzController {
    async fn apply(&self, target_id: &str, command: &PtzCommand) -> Result<()> {
        if command.is_stop() {
            tracing::info!(target: "gb28181::ptz", %target_id, "PTZ stop");
        } else {
            tracing::info!(
                target: "gb28181::ptz",
                %target_id,
                motions = ?command.motions(),
                pan_speed = command.pan_speed,
                tilt_speed = command.tilt_speed,
                zoom_speed = command.zoom_speed,
                "PTZ move",
            );
        }
        Ok(())
    }
}

/// 处理结果（供日志与测试观察）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// 消息体无法解码，已回复 400
    Rejected,
    /// 已回复 200 并发送应答文档
    Answered(CommandKind),
    /// PTZ 指令非法，已回复 400
    InvalidControl,
    /// 未识别的命令，仅回复 200
    Ignored,
}

pub struct CommandHandler {
    identity: Arc<DeviceIdentity>,
    profile: DeviceProfile,
    directory: Arc<dyn ChannelDirectory>,
    ptz: Arc<dyn PtzController>,
    signaling: Arc<dyn Signaling>,
}

impl CommandHandler {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        profile: DeviceProfile,
        directory: Arc<dyn ChannelDirectory>,
        ptz: Arc<dyn PtzController>,
        signaling: Arc<dyn Signaling>,
    ) -> Self {
        Self {
            identity,
            profile,
            directory,
            ptz,
            signaling,
        }
    }

    /// 处理一条 MESSAGE；只有发送失败才返回错误
    pub async fn handle(&self, tx: &TransactionId, body: &str) -> Result<CommandOutcome> {
        let command = match decode(body) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(target: "gb28181::agent", %tx, error = %e, "Undecodable MESSAGE body");
                let reply = build_error_response(None, &self.identity.device_id);
                self.signaling.reply(tx, 400, Some(reply)).await?;
                return Ok(CommandOutcome::Rejected);
            }
        };

        let span = tracing::info_span!(
            "gb28181.agent.command",
            cmd_type = ?command.kind,
            sn = %command.sn,
        );
        self.dispatch(tx, command).instrument(span).await
    }

    async fn dispatch(&self, tx: &TransactionId, command: IncomingCommand) -> Result<CommandOutcome> {
        match &command.kind {
            CommandKind::Catalog => {
                let channels = self.directory.list_channels(&self.identity.device_id);
                tracing::info!(target: "gb28181::agent", channels = channels.len(), "Catalog query");
                let doc = build_catalog_response(&command.sn, &self.identity, &channels);
                self.answer(tx, doc).await?;
            }
            CommandKind::DeviceInfo => {
                let doc = build_device_info_response(&command.sn, &self.identity.device_id, &self.profile);
                self.answer(tx, doc).await?;
            }
            CommandKind::DeviceStatus => {
                let now = chrono::Local::now().naive_local();
                let doc = build_device_status_response(&command.sn, &self.identity.device_id, true, now);
                self.answer(tx, doc).await?;
            }
            CommandKind::DeviceControl => return self.handle_control(tx, &command).await,
            CommandKind::Unknown(cmd_type) => {
                tracing::debug!(target: "gb28181::agent", %cmd_type, "Ignoring unsupported command");
                self.signaling.reply(tx, 200, None).await?;
                return Ok(CommandOutcome::Ignored);
            }
        }

        Ok(CommandOutcome::Answered(command.kind))
    }

    async fn handle_control(&self, tx: &TransactionId, command: &IncomingCommand) -> Result<CommandOutcome> {
        let target_id = if command.device_id.is_empty() {
            self.identity.device_id.as_str()
        } else {
            command.device_id.as_str()
        };

        let Some(payload) = command.ptz_cmd.as_deref() else {
            tracing::warn!(target: "gb28181::agent", %target_id, "Unsupported device control");
            let doc = build_control_response(&command.sn, &self.identity.device_id, false);
            self.answer(tx, doc).await?;
            return Ok(CommandOutcome::Answered(CommandKind::DeviceControl));
        };

        let ptz = match PtzCommand::decode(payload) {
            Ok(ptz) => ptz,
            Err(e @ (AgentError::InvalidLength(_) | AgentError::Parse(_))) => {
                tracing::warn!(target: "gb28181::agent", %target_id, %payload, error = %e, "Invalid PTZCmd");
                self.signaling.reply(tx, 400, None).await?;
                return Ok(CommandOutcome::InvalidControl);
            }
            Err(e) => return Err(e),
        };

        let ok = match self.ptz.apply(target_id, &ptz).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(target: "gb28181::agent", %target_id, error = %e, "PTZ controller failed");
                false
            }
        };

        let doc = build_control_response(&command.sn, &self.identity.device_id, ok);
        self.answer(tx, doc).await?;
        Ok(CommandOutcome::Answered(CommandKind::DeviceControl))
    }

    /// 先以 200 结束查询事务，再把应答文档作为新的 MESSAGE 发给平台
    async fn answer(&self, tx: &TransactionId, doc: String) -> Result<()> {
        self.signaling.reply(tx, 200, None).await?;
        self.signaling.send_message(doc).await
    }
}
