// PTZ 控制指令解码
// PTZCmd 为 8 字节指令的 16 位十六进制字符串

use crate::{AgentError, Result};

/// PTZCmd 十六进制长度
pub const PTZ_CMD_HEX_LEN: usize = 16;

/// 单个运动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzMotion {
    TiltUp,
    TiltDown,
    PanLeft,
    PanRight,
    ZoomIn,
    ZoomOut,
}

impl PtzMotion {
    const ALL: [(u8, PtzMotion); 6] = [
        (0x01, PtzMotion::TiltUp),
        (0x02, PtzMotion::TiltDown),
        (0x04, PtzMotion::PanLeft),
        (0x08, PtzMotion::PanRight),
        (0x10, PtzMotion::ZoomIn),
        (0x20, PtzMotion::ZoomOut),
    ];
}

/// 解码后的 PTZ 指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtzCommand {
    /// 方向位掩码（字节 3）
    pub direction: u8,
    /// 水平速度（字节 4）
    pub pan_speed: u8,
    /// 垂直速度（字节 5）
    pub tilt_speed: u8,
    /// 变倍速度（字节 6）
    pub zoom_speed: u8,
}

impl PtzCommand {
    /// 解码 PTZCmd；长度必须正好 16 个字符
    pub fn decode(payload: &str) -> Result<Self> {
        let len = payload.chars().count();
        if len != PTZ_CMD_HEX_LEN {
            return Err(AgentError::InvalidLength(len));
        }

        let bytes = hex::decode(payload)
            .map_err(|e| AgentError::Parse(format!("PTZCmd is not hex: {}", e)))?;

        Ok(Self {
            direction: bytes[3],
            pan_speed: bytes[4],
            tilt_speed: bytes[5],
            zoom_speed: bytes[6],
        })
    }

    /// 全部置位的运动方向（可同时包含水平、垂直、变倍）
    pub fn motions(&self) -> Vec<PtzMotion> {
        PtzMotion::ALL
            .iter()
            .filter(|(bit, _)| self.direction & bit != 0)
            .map(|(_, motion)| *motion)
            .collect()
    }

    /// 方向字节为 0 即为停止；只有保留位（0x40/0x80）的指令不算停止
    pub fn is_stop(&self) -> bool {
        self.direction == 0
    }
}

pub fn decode_ptz(payload: &str) -> Result<PtzCommand> {
    PtzCommand::decode(payload)
}
