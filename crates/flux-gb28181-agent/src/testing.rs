// 单元测试用的信令与媒体替身

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::media::{MediaPipeline, MediaTarget};
use crate::signaling::{Signaling, TransactionId};
use crate::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Register(u32),
    Message(String),
    Reply { tx: String, status: u16, body: Option<String> },
    Answer { tx: String, sdp: String },
}

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, item: Sent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("link down".to_string()));
        }
        self.sent.lock().unwrap().push(item);
        Ok(())
    }
}

#[async_trait]
impl Signaling for RecordingSignaling {
    async fn send_register(&self, expires: u32) -> Result<()> {
        self.record(Sent::Register(expires))
    }

    async fn send_message(&self, body: String) -> Result<()> {
        self.record(Sent::Message(body))
    }

    async fn reply(&self, tx: &TransactionId, status: u16, body: Option<String>) -> Result<()> {
        self.record(Sent::Reply { tx: tx.0.clone(), status, body })
    }

    async fn answer(&self, tx: &TransactionId, sdp: String) -> Result<()> {
        self.record(Sent::Answer { tx: tx.0.clone(), sdp })
    }
}

/// 运行直到被取消的媒体管线，统计启动与退出次数
#[derive(Default)]
pub struct CountingPipeline {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    /// 收到取消后再拖延多久才退出
    pub stop_delay: Duration,
}

impl CountingPipeline {
    pub fn slow_to_stop(stop_delay: Duration) -> Self {
        Self {
            stop_delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaPipeline for CountingPipeline {
    async fn run(&self, _target: MediaTarget, cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 启动后立即失败的媒体管线
#[derive(Default)]
pub struct FailingPipeline {
    pub started: AtomicUsize,
}

#[async_trait]
impl MediaPipeline for FailingPipeline {
    async fn run(&self, _target: MediaTarget, _cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Media("encoder unavailable".to_string()))
    }
}
