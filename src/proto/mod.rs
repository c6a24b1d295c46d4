pub mod command;
pub mod frames;
pub mod smtp;

pub use command::{AgentMessage, Command, FilterReply, OptionNegotiation, PeerAddr, ReplyCommand};
pub use frames::{FrameError, Packet, PacketCodec, DEFAULT_CHUNK_SIZE};
pub use smtp::{EnhancedCode, ReplyCode, SmtpReply, MAX_REPLY_LINES};
