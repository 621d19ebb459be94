// 媒体推流任务
// 每个会话一个 tokio 任务，通过 CancellationToken 协作停止

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::sip::MediaEndpoint;
use crate::{AgentError, Result};

/// 推流目标
#[derive(Debug, Clone)]
pub struct MediaTarget {
    pub call_id: String,
    pub local_port: u16,
    pub remote: MediaEndpoint,
    /// 平台在 y= 中指定的 SSRC
    pub ssrc: Option<String>,
}

/// 媒体管线：持续推流直到 cancel 被触发
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    async fn run(&self, target: MediaTarget, cancel: CancellationToken) -> Result<()>;
}

/// 会话持有的推流任务
#[derive(Debug)]
pub struct MediaWorker {
    cancel: CancellationToken,
    /// 任务退出（无论是否被要求停止）时触发
    ended: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MediaWorker {
    pub fn start(pipeline: Arc<dyn MediaPipeline>, target: MediaTarget) -> Self {
        let cancel = CancellationToken::new();
        let ended = CancellationToken::new();
        let token = cancel.clone();
        let done = ended.clone();
        let span = tracing::info_span!(
            "gb28181.media.worker",
            call_id = %target.call_id,
            local_port = target.local_port,
        );

        let task = tokio::spawn(
            async move {
                tracing::info!(target: "gb28181::media", remote = %target.remote, "Media worker started");
                let _done = done.drop_guard();
                match pipeline.run(target, token).await {
                    Ok(()) => tracing::info!(target: "gb28181::media", "Media worker finished"),
                    Err(e) => tracing::error!(target: "gb28181::media", error = %e, "Media worker failed"),
                }
            }
            .instrument(span),
        );

        Self {
            cancel,
            ended,
            task: Some(task),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 推流任务退出后被取消；与 token() 对照可区分主动停止和自行退出
    pub fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// 通知停止并等待任务退出
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(target: "gb28181::media", error = %e, "Media worker panicked");
            }
        }
    }
}

impl Drop for MediaWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 通过外部程序推流（如 ffmpeg），参数中的占位符在启动时替换：
/// `{local_port}` `{remote_addr}` `{remote_port}` `{call_id}` `{ssrc}`
#[derive(Debug, Clone)]
pub struct ProcessPipeline {
    program: String,
    args: Vec<String>,
}

impl ProcessPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, target: &MediaTarget) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{local_port}", &target.local_port.to_string())
                    .replace("{remote_addr}", &target.remote.address)
                    .replace("{remote_port}", &target.remote.port.to_string())
                    .replace("{call_id}", &target.call_id)
                    .replace("{ssrc}", target.ssrc.as_deref().unwrap_or("0"))
            })
            .collect()
    }
}

#[async_trait]
impl MediaPipeline for ProcessPipeline {
    async fn run(&self, target: MediaTarget, cancel: CancellationToken) -> Result<()> {
        let args = self.render_args(&target);
        tracing::debug!(target: "gb28181::media", program = %self.program, ?args, "Spawning media process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Media(format!("spawn {} failed: {}", self.program, e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(AgentError::Media(format!("{} exited with {}", self.program, status)))
                }
            }
            _ = cancel.cancelled() => {
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// 内置测试码流：周期发送 RTP 封装的 PS 包（H.264 关键帧）
#[derive(Debug, Clone)]
pub struct TestPatternPipeline {
    bind_ip: String,
    frame_interval: Duration,
}

impl TestPatternPipeline {
    pub fn new(bind_ip: impl Into<String>) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            frame_interval: Duration::from_millis(40),
        }
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }
}

#[async_trait]
impl MediaPipeline for TestPatternPipeline {
    async fn run(&self, target: MediaTarget, cancel: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind((self.bind_ip.as_str(), target.local_port)).await?;
        let remote: SocketAddr = tokio::net::lookup_host((target.remote.address.as_str(), target.remote.port))
            .await?
            .next()
            .ok_or_else(|| AgentError::Media(format!("cannot resolve {}", target.remote)))?;

        let ssrc = target
            .ssrc
            .as_deref()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or_else(rand::random);
        let payload = build_ps_payload();

        let mut sequence: u16 = 1;
        let mut timestamp: u32 = 0;
        let mut ticker = tokio::time::interval(self.frame_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let packet = build_rtp_packet(ssrc, sequence, timestamp, true, &payload);
                    socket.send_to(&packet, remote).await?;
                    sequence = sequence.wrapping_add(1);
                    timestamp = timestamp.wrapping_add(3600);
                }
            }
        }
    }
}

/// RTP 头（V=2，PT=96）+ 负载
pub fn build_rtp_packet(ssrc: u32, sequence: u16, timestamp: u32, marker: bool, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(12 + payload.len());
    packet.put_u8(0x80);
    packet.put_u8(if marker { 0x80 | 96 } else { 96 });
    packet.put_u16(sequence);
    packet.put_u32(timestamp);
    packet.put_u32(ssrc);
    packet.put_slice(payload);
    packet.freeze()
}

/// PS pack header + 视频 PES
fn build_ps_payload() -> Bytes {
    let h264 = build_h264_keyframe();
    let pes_length = (h264.len() + 3) as u16;

    let mut buf = BytesMut::with_capacity(14 + 6 + pes_length as usize);
    buf.put_slice(&[0x00, 0x00, 0x01, 0xBA]);
    buf.put_bytes(0, 10);
    buf.put_slice(&[0x00, 0x00, 0x01, 0xE0]);
    buf.put_u16(pes_length);
    buf.put_slice(&[0x80, 0x00, 0x00]);
    buf.put_slice(&h264);
    buf.freeze()
}

fn build_h264_keyframe() -> Vec<u8> {
    let mut data = Vec::new();
    // SPS
    data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0xe9, 0x02, 0xc1, 0x2c, 0x80]);
    // PPS
    data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]);
    // IDR
    data.extend_from_slice(&[0, 0, 0, 1, 0x65]);
    data.extend_from_slice(&[0x88; 120]);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingPipeline, FailingPipeline};
    use std::sync::atomic::Ordering;

    fn target(local_port: u16, remote_port: u16) -> MediaTarget {
        MediaTarget {
            call_id: "call-1".to_string(),
            local_port,
            remote: MediaEndpoint {
                address: "127.0.0.1".to_string(),
                port: remote_port,
            },
            ssrc: Some("0100000001".to_string()),
        }
    }

    #[test]
    fn test_rtp_header_layout() {
        let packet = build_rtp_packet(0x01020304, 7, 3600, true, &[0xAA, 0xBB]);

        assert_eq!(packet.len(), 14);
        assert_eq!(packet[0], 0x80);
        assert_eq!(packet[1], 0x80 | 96);
        assert_eq!(&packet[2..4], &[0x00, 0x07]);
        assert_eq!(&packet[4..8], &3600u32.to_be_bytes());
        assert_eq!(&packet[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&packet[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_ps_payload_starts_with_pack_header() {
        let ps = build_ps_payload();
        assert_eq!(&ps[..4], &[0x00, 0x00, 0x01, 0xBA]);
        assert_eq!(&ps[14..18], &[0x00, 0x00, 0x01, 0xE0]);
    }

    #[test]
    fn test_process_args_are_rendered() {
        let pipeline = ProcessPipeline::new(
            "ffmpeg",
            vec![
                "-ssrc".to_string(),
                "{ssrc}".to_string(),
                "rtp://{remote_addr}:{remote_port}?localport={local_port}".to_string(),
            ],
        );

        let args = pipeline.render_args(&target(30000, 9000));

        assert_eq!(args[1], "0100000001");
        assert_eq!(args[2], "rtp://127.0.0.1:9000?localport=30000");
    }

    #[tokio::test]
    async fn test_stop_joins_worker() {
        let pipeline = Arc::new(CountingPipeline::default());
        let mut worker = MediaWorker::start(pipeline.clone(), target(30000, 9000));

        tokio::task::yield_now().await;
        assert!(worker.is_running());

        worker.stop().await;

        assert!(!worker.is_running());
        assert_eq!(pipeline.started.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ended_fires_when_pipeline_fails() {
        let pipeline = Arc::new(FailingPipeline::default());
        let mut worker = MediaWorker::start(pipeline.clone(), target(30000, 9000));

        tokio::time::timeout(Duration::from_secs(1), worker.ended().cancelled())
            .await
            .unwrap();

        assert!(!worker.token().is_cancelled());
        assert_eq!(pipeline.started.load(Ordering::SeqCst), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_pattern_sends_rtp_until_cancelled() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_port = receiver.local_addr().unwrap().port();

        let pipeline = Arc::new(TestPatternPipeline::new("127.0.0.1").with_frame_interval(Duration::from_millis(5)));
        let mut worker = MediaWorker::start(pipeline, target(0, remote_port));

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert!(len > 12);
        assert_eq!(buf[1] & 0x7F, 96);
        assert_eq!(&buf[8..12], &100000001u32.to_be_bytes());

        worker.stop().await;
        assert!(!worker.is_running());
    }
}
