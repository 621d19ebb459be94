// 呼叫会话管理
// 以 Call-ID 为键，注册表持有每个会话的推流任务

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::media::{MediaWorker, PortAllocator};
use crate::sip::MediaEndpoint;
use crate::{AgentError, Result};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Negotiating,
    Active,
    Closed,
    Rejected,
}

/// 一路已接受的点播
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    pub remote: MediaEndpoint,
    pub local_port: u16,
    pub state: CallState,
    pub ssrc: Option<String>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub worker: MediaWorker,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        remote: MediaEndpoint,
        local_port: u16,
        ssrc: Option<String>,
        worker: MediaWorker,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            remote,
            local_port,
            state: CallState::Negotiating,
            ssrc,
            acknowledged: false,
            created_at: Utc::now(),
            worker,
        }
    }
}

/// 重复插入时交还给调用方的会话
#[derive(Debug)]
pub struct InsertRejected {
    pub error: AgentError,
    pub session: CallSession,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, CallSession>>,
    ports: Arc<PortAllocator>,
}

impl SessionRegistry {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ports,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// 插入会话；Call-ID 已存在时不修改注册表，原样交还会话
    pub async fn insert(&self, session: CallSession) -> std::result::Result<(), InsertRejected> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.call_id) {
            return Err(InsertRejected {
                error: AgentError::SessionAlreadyExists(session.call_id.clone()),
                session,
            });
        }
        sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    pub async fn remove(&self, call_id: &str) -> Result<CallSession> {
        self.sessions
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| AgentError::UnknownCallId(call_id.to_string()))
    }

    /// 会话满足条件时在锁内移除、停止推流并归还端口
    ///
    /// 与 stop_all 一样在持锁期间等待任务退出，因此 stop_all 不会错过
    /// 正在被拆除的会话。返回的会话推流任务已结束。
    pub async fn stop_if<F>(&self, call_id: &str, predicate: F) -> Option<CallSession>
    where
        F: FnOnce(&CallSession) -> bool,
    {
        let mut sessions = self.sessions.lock().await;
        if !sessions.get(call_id).map(predicate).unwrap_or(false) {
            return None;
        }

        let mut session = sessions.remove(call_id)?;
        session.worker.stop().await;
        self.ports.release(session.local_port);
        Some(session)
    }

    pub async fn set_state(&self, call_id: &str, state: CallState) -> bool {
        match self.sessions.lock().await.get_mut(call_id) {
            Some(session) => {
                session.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn mark_acknowledged(&self, call_id: &str) -> bool {
        match self.sessions.lock().await.get_mut(call_id) {
            Some(session) => {
                session.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub async fn is_acknowledged(&self, call_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(call_id)
            .map(|s| s.acknowledged)
            .unwrap_or(false)
    }

    pub async fn contains(&self, call_id: &str) -> bool {
        self.sessions.lock().await.contains_key(call_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// 在锁内遍历，看到的是一致快照
    pub async fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&CallSession),
    {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            visitor(session);
        }
    }

    /// 停止所有推流任务并等待退出，归还端口后清空
    pub async fn stop_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();

        for (call_id, mut session) in sessions.drain() {
            session.worker.stop().await;
            self.ports.release(session.local_port);
            tracing::info!(
                target: "gb28181::agent",
                %call_id,
                port = session.local_port,
                "Session stopped on shutdown"
            );
        }

        count
    }
}
