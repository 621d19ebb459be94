// RTP 端口分配
// 只分配偶数端口，奇数端口（port + 1）留给 RTCP

use std::collections::HashSet;
use std::sync::Mutex;

use crate::{AgentError, Result};

#[derive(Debug)]
struct PortState {
    cursor: u32,
    leased: HashSet<u16>,
}

/// 在闭区间 [start, end] 内租借偶数端口
#[derive(Debug)]
pub struct PortAllocator {
    start: u32,
    end: u32,
    state: Mutex<PortState>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        let first = (start as u32 + 1) & !1;
        let end = end as u32;
        if start as u32 > end || first > end {
            return Err(AgentError::Config(format!(
                "media port range {}-{} holds no even port",
                start, end
            )));
        }

        Ok(Self {
            start: first,
            end,
            state: Mutex::new(PortState {
                cursor: first,
                leased: HashSet::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 可租借的端口总数
    pub fn capacity(&self) -> usize {
        ((self.end - self.start) / 2 + 1) as usize
    }

    /// 从游标开始向后扫描，到区间末尾回绕一次
    pub fn lease(&self) -> Result<u16> {
        let mut state = self.lock();
        let mut candidate = state.cursor;

        for _ in 0..self.capacity() {
            if candidate > self.end {
                candidate = self.start;
            }
            let port = candidate as u16;
            if !state.leased.contains(&port) {
                state.leased.insert(port);
                state.cursor = candidate + 2;
                tracing::debug!(target: "gb28181::media", port, "Leased media port");
                return Ok(port);
            }
            candidate += 2;
        }

        Err(AgentError::PortExhausted)
    }

    /// 归还端口；重复归还或区间外端口不做任何事
    pub fn release(&self, port: u16) {
        if self.lock().leased.remove(&port) {
            tracing::debug!(target: "gb28181::media", port, "Released media port");
        }
    }

    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().leased.contains(&port)
    }
}
