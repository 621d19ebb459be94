// GB28181 MANSCDP 应用层（XML 命令）

pub mod command;
pub mod handler;
pub mod ptz;
pub mod response;

pub use command::{decode, CommandKind, IncomingCommand};
pub use handler::{CommandHandler, CommandOutcome, LoggingPtzController, PtzController};
pub use ptz::{decode_ptz, PtzCommand, PtzMotion};
pub use response::{
    build_catalog_response, build_keepalive, ChannelDirectory, ChannelInfo, ChannelStatus,
    StaticChannelDirectory,
};
