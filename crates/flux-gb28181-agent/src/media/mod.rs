// 媒体面：端口租借与推流任务

pub mod port;
pub mod worker;

pub use port::PortAllocator;
pub use worker::{
    build_rtp_packet, MediaPipeline, MediaTarget, MediaWorker, ProcessPipeline, TestPatternPipeline,
};
