//! Payload layouts of every agent command and filter reply.
//!
//! String fields are NUL-terminated, integers are big-endian. Decoding never
//! looks past the packet it was given, so a malformed payload only ever
//! costs the connection it arrived on. Strings coming from the agent are
//! kept as raw bytes; header values and addresses need not be UTF-8.

use bstr::{BString, ByteSlice};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::frames::{FrameError, Packet};

/// Commands sent by the mail agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Abort the current message
    Abort = b'A',
    /// Body chunk
    Body = b'B',
    /// Connection information
    Connect = b'C',
    /// Macro definitions for the next stage
    Macro = b'D',
    /// Final body chunk
    EndOfMessage = b'E',
    /// HELO/EHLO name
    Helo = b'H',
    /// Quit, but keep the filter connection for another client
    QuitNewConnection = b'K',
    /// Single header
    Header = b'L',
    /// MAIL FROM
    Mail = b'M',
    /// End of headers
    EndOfHeaders = b'N',
    /// Option negotiation
    Negotiate = b'O',
    /// Close the filter connection
    Quit = b'Q',
    /// RCPT TO
    Recipient = b'R',
    /// DATA
    Data = b'T',
    /// Unrecognized SMTP command
    Unknown = b'U',
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'A' => Some(Self::Abort),
            b'B' => Some(Self::Body),
            b'C' => Some(Self::Connect),
            b'D' => Some(Self::Macro),
            b'E' => Some(Self::EndOfMessage),
            b'H' => Some(Self::Helo),
            b'K' => Some(Self::QuitNewConnection),
            b'L' => Some(Self::Header),
            b'M' => Some(Self::Mail),
            b'N' => Some(Self::EndOfHeaders),
            b'O' => Some(Self::Negotiate),
            b'Q' => Some(Self::Quit),
            b'R' => Some(Self::Recipient),
            b'T' => Some(Self::Data),
            b'U' => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Body => "body",
            Self::Connect => "connect",
            Self::Macro => "macro",
            Self::EndOfMessage => "end-of-message",
            Self::Helo => "helo",
            Self::QuitNewConnection => "quit-nc",
            Self::Header => "header",
            Self::Mail => "mail",
            Self::EndOfHeaders => "end-of-headers",
            Self::Negotiate => "negotiate",
            Self::Quit => "quit",
            Self::Recipient => "rcpt",
            Self::Data => "data",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replies sent by the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCommand {
    AddRecipient = b'+',
    DeleteRecipient = b'-',
    AddRecipientWithParams = b'2',
    Accept = b'a',
    ReplaceBody = b'b',
    Continue = b'c',
    Discard = b'd',
    ChangeSender = b'e',
    AddHeader = b'h',
    InsertHeader = b'i',
    ChangeHeader = b'm',
    Progress = b'p',
    Quarantine = b'q',
    Reject = b'r',
    Skip = b's',
    Tempfail = b't',
    ReplyCode = b'y',
    Negotiate = b'O',
}

impl ReplyCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'+' => Some(Self::AddRecipient),
            b'-' => Some(Self::DeleteRecipient),
            b'2' => Some(Self::AddRecipientWithParams),
            b'a' => Some(Self::Accept),
            b'b' => Some(Self::ReplaceBody),
            b'c' => Some(Self::Continue),
            b'd' => Some(Self::Discard),
            b'e' => Some(Self::ChangeSender),
            b'h' => Some(Self::AddHeader),
            b'i' => Some(Self::InsertHeader),
            b'm' => Some(Self::ChangeHeader),
            b'p' => Some(Self::Progress),
            b'q' => Some(Self::Quarantine),
            b'r' => Some(Self::Reject),
            b's' => Some(Self::Skip),
            b't' => Some(Self::Tempfail),
            b'y' => Some(Self::ReplyCode),
            b'O' => Some(Self::Negotiate),
            _ => None,
        }
    }
}

/// Address family tags used in the connect payload
pub const FAMILY_UNKNOWN: u8 = b'U';
pub const FAMILY_UNIX: u8 = b'L';
pub const FAMILY_INET: u8 = b'4';
pub const FAMILY_INET6: u8 = b'6';

/// Address of the SMTP client the agent is talking to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// The agent could not tell (e.g. local submission)
    Unknown,
    Unix(BString),
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

impl PeerAddr {
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::V4(_, port) | Self::V6(_, port) => Some(*port),
            _ => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Unix(path) => write!(f, "unix:{path}"),
            Self::V4(ip, port) => write!(f, "{ip}:{port}"),
            Self::V6(ip, port) => write!(f, "[{ip}]:{port}"),
        }
    }
}

/// Raw option negotiation fields as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionNegotiation {
    pub version: u32,
    pub actions: u32,
    pub steps: u32,
}

/// A decoded agent command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    Negotiate(OptionNegotiation),
    Macros {
        /// Command byte of the stage these macros belong to
        stage: u8,
        pairs: Vec<(BString, BString)>,
    },
    Connect {
        hostname: BString,
        address: PeerAddr,
    },
    Helo(Option<BString>),
    Mail {
        address: BString,
        args: Vec<BString>,
    },
    Recipient {
        address: BString,
        args: Vec<BString>,
    },
    Data,
    Header {
        name: BString,
        value: BString,
    },
    EndOfHeaders,
    Body(Bytes),
    /// May carry the final body chunk
    EndOfMessage(Bytes),
    Abort,
    Quit,
    QuitNewConnection,
    Unknown(BString),
}

impl AgentMessage {
    pub fn command(&self) -> Command {
        match self {
            Self::Negotiate(_) => Command::Negotiate,
            Self::Macros { .. } => Command::Macro,
            Self::Connect { .. } => Command::Connect,
            Self::Helo(_) => Command::Helo,
            Self::Mail { .. } => Command::Mail,
            Self::Recipient { .. } => Command::Recipient,
            Self::Data => Command::Data,
            Self::Header { .. } => Command::Header,
            Self::EndOfHeaders => Command::EndOfHeaders,
            Self::Body(_) => Command::Body,
            Self::EndOfMessage(_) => Command::EndOfMessage,
            Self::Abort => Command::Abort,
            Self::Quit => Command::Quit,
            Self::QuitNewConnection => Command::QuitNewConnection,
            Self::Unknown(_) => Command::Unknown,
        }
    }

    /// Decode a packet received from the agent
    pub fn decode(packet: &Packet) -> Result<Self, FrameError> {
        let command =
            Command::from_u8(packet.command).ok_or(FrameError::UnknownCommand(packet.command))?;
        let mut fields = Fields::new(command.name(), &packet.payload);

        let message = match command {
            Command::Negotiate => Self::Negotiate(OptionNegotiation {
                version: fields.u32()?,
                actions: fields.u32()?,
                steps: fields.u32()?,
            }),
            Command::Macro => {
                let stage = fields.u8()?;
                let mut pairs = Vec::new();
                while !fields.is_empty() {
                    let name = fields.cstr()?;
                    let value = fields.cstr()?;
                    pairs.push((name, value));
                }
                Self::Macros { stage, pairs }
            }
            Command::Connect => {
                let hostname = fields.cstr()?;
                let address = fields.peer_addr()?;
                Self::Connect { hostname, address }
            }
            Command::Helo => {
                if fields.is_empty() {
                    Self::Helo(None)
                } else {
                    Self::Helo(Some(fields.cstr()?))
                }
            }
            Command::Mail => {
                let (address, args) = fields.envelope()?;
                Self::Mail { address, args }
            }
            Command::Recipient => {
                let (address, args) = fields.envelope()?;
                Self::Recipient { address, args }
            }
            Command::Data => Self::Data,
            Command::Header => Self::Header {
                name: fields.cstr()?,
                value: fields.cstr()?,
            },
            Command::EndOfHeaders => Self::EndOfHeaders,
            Command::Body => Self::Body(packet.payload.clone()),
            Command::EndOfMessage => Self::EndOfMessage(packet.payload.clone()),
            Command::Abort => Self::Abort,
            Command::Quit => Self::Quit,
            Command::QuitNewConnection => Self::QuitNewConnection,
            Command::Unknown => Self::Unknown(fields.cstr()?),
        };

        Ok(message)
    }

    /// Encode into a packet, as the agent would send it
    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            Self::Negotiate(opt) => {
                buf.put_u32(opt.version);
                buf.put_u32(opt.actions);
                buf.put_u32(opt.steps);
            }
            Self::Macros { stage, pairs } => {
                buf.put_u8(*stage);
                for (name, value) in pairs {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
            Self::Connect { hostname, address } => {
                put_cstr(&mut buf, hostname);
                match address {
                    PeerAddr::Unknown => buf.put_u8(FAMILY_UNKNOWN),
                    PeerAddr::Unix(path) => {
                        buf.put_u8(FAMILY_UNIX);
                        buf.put_u16(0);
                        put_cstr(&mut buf, path);
                    }
                    PeerAddr::V4(ip, port) => {
                        buf.put_u8(FAMILY_INET);
                        buf.put_u16(*port);
                        put_cstr(&mut buf, ip.to_string().as_bytes());
                    }
                    PeerAddr::V6(ip, port) => {
                        buf.put_u8(FAMILY_INET6);
                        buf.put_u16(*port);
                        put_cstr(&mut buf, ip.to_string().as_bytes());
                    }
                }
            }
            Self::Helo(name) => {
                if let Some(name) = name {
                    put_cstr(&mut buf, name);
                }
            }
            Self::Mail { address, args } | Self::Recipient { address, args } => {
                put_cstr(&mut buf, address);
                for arg in args {
                    put_cstr(&mut buf, arg);
                }
            }
            Self::Header { name, value } => {
                put_cstr(&mut buf, name);
                put_cstr(&mut buf, value);
            }
            Self::Body(chunk) | Self::EndOfMessage(chunk) => buf.extend_from_slice(chunk),
            Self::Unknown(line) => put_cstr(&mut buf, line),
            Self::Data
            | Self::EndOfHeaders
            | Self::Abort
            | Self::Quit
            | Self::QuitNewConnection => {}
        }
        Packet::new(self.command() as u8, buf.freeze())
    }
}

/// A reply or modification request sent back to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReply {
    Negotiate {
        version: u32,
        actions: u32,
        steps: u32,
        /// (macro stage, space separated macro names)
        symbol_lists: Vec<(u32, String)>,
    },
    Continue,
    Reject,
    Discard,
    Accept,
    Tempfail,
    Skip,
    /// Fully assembled SMTP reply text
    ReplyCode(String),
    AddHeader {
        name: BString,
        value: BString,
    },
    InsertHeader {
        index: u32,
        name: BString,
        value: BString,
    },
    /// An empty value deletes the header
    ChangeHeader {
        index: u32,
        name: BString,
        value: BString,
    },
    ChangeSender {
        address: BString,
        args: Option<BString>,
    },
    AddRecipient(BString),
    AddRecipientWithParams {
        address: BString,
        args: BString,
    },
    DeleteRecipient(BString),
    ReplaceBody(Bytes),
    Quarantine(BString),
    Progress,
}

impl FilterReply {
    pub fn command(&self) -> ReplyCommand {
        match self {
            Self::Negotiate { .. } => ReplyCommand::Negotiate,
            Self::Continue => ReplyCommand::Continue,
            Self::Reject => ReplyCommand::Reject,
            Self::Discard => ReplyCommand::Discard,
            Self::Accept => ReplyCommand::Accept,
            Self::Tempfail => ReplyCommand::Tempfail,
            Self::Skip => ReplyCommand::Skip,
            Self::ReplyCode(_) => ReplyCommand::ReplyCode,
            Self::AddHeader { .. } => ReplyCommand::AddHeader,
            Self::InsertHeader { .. } => ReplyCommand::InsertHeader,
            Self::ChangeHeader { .. } => ReplyCommand::ChangeHeader,
            Self::ChangeSender { .. } => ReplyCommand::ChangeSender,
            Self::AddRecipient(_) => ReplyCommand::AddRecipient,
            Self::AddRecipientWithParams { .. } => ReplyCommand::AddRecipientWithParams,
            Self::DeleteRecipient(_) => ReplyCommand::DeleteRecipient,
            Self::ReplaceBody(_) => ReplyCommand::ReplaceBody,
            Self::Quarantine(_) => ReplyCommand::Quarantine,
            Self::Progress => ReplyCommand::Progress,
        }
    }

    /// True for replies that modify the message rather than answer a stage
    pub fn is_modification(&self) -> bool {
        matches!(
            self,
            Self::AddHeader { .. }
                | Self::InsertHeader { .. }
                | Self::ChangeHeader { .. }
                | Self::ChangeSender { .. }
                | Self::AddRecipient(_)
                | Self::AddRecipientWithParams { .. }
                | Self::DeleteRecipient(_)
                | Self::ReplaceBody(_)
                | Self::Quarantine(_)
        )
    }

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            Self::Negotiate {
                version,
                actions,
                steps,
                symbol_lists,
            } => {
                buf.put_u32(*version);
                buf.put_u32(*actions);
                buf.put_u32(*steps);
                for (stage, names) in symbol_lists {
                    buf.put_u32(*stage);
                    put_cstr(&mut buf, names.as_bytes());
                }
            }
            Self::ReplyCode(text) => put_cstr(&mut buf, text.as_bytes()),
            Self::AddHeader { name, value } => {
                put_cstr(&mut buf, name);
                put_cstr(&mut buf, value);
            }
            Self::InsertHeader { index, name, value } | Self::ChangeHeader { index, name, value } => {
                buf.put_u32(*index);
                put_cstr(&mut buf, name);
                put_cstr(&mut buf, value);
            }
            Self::ChangeSender { address, args } => {
                put_cstr(&mut buf, address);
                if let Some(args) = args {
                    put_cstr(&mut buf, args);
                }
            }
            Self::AddRecipient(address) | Self::DeleteRecipient(address) => {
                put_cstr(&mut buf, address)
            }
            Self::AddRecipientWithParams { address, args } => {
                put_cstr(&mut buf, address);
                put_cstr(&mut buf, args);
            }
            Self::ReplaceBody(chunk) => buf.extend_from_slice(chunk),
            Self::Quarantine(reason) => put_cstr(&mut buf, reason),
            Self::Continue
            | Self::Reject
            | Self::Discard
            | Self::Accept
            | Self::Tempfail
            | Self::Skip
            | Self::Progress => {}
        }
        Packet::new(self.command() as u8, buf.freeze())
    }

    /// Decode a reply, as the agent would read it
    pub fn decode(packet: &Packet) -> Result<Self, FrameError> {
        let command = ReplyCommand::from_u8(packet.command)
            .ok_or(FrameError::UnknownCommand(packet.command))?;
        let mut fields = Fields::new("reply", &packet.payload);

        let reply = match command {
            ReplyCommand::Negotiate => {
                let version = fields.u32()?;
                let actions = fields.u32()?;
                let steps = fields.u32()?;
                let mut symbol_lists = Vec::new();
                while !fields.is_empty() {
                    let stage = fields.u32()?;
                    symbol_lists.push((stage, fields.text()?));
                }
                Self::Negotiate {
                    version,
                    actions,
                    steps,
                    symbol_lists,
                }
            }
            ReplyCommand::Continue => Self::Continue,
            ReplyCommand::Reject => Self::Reject,
            ReplyCommand::Discard => Self::Discard,
            ReplyCommand::Accept => Self::Accept,
            ReplyCommand::Tempfail => Self::Tempfail,
            ReplyCommand::Skip => Self::Skip,
            ReplyCommand::Progress => Self::Progress,
            ReplyCommand::ReplyCode => Self::ReplyCode(fields.text()?),
            ReplyCommand::AddHeader => Self::AddHeader {
                name: fields.cstr()?,
                value: fields.cstr()?,
            },
            ReplyCommand::InsertHeader => Self::InsertHeader {
                index: fields.u32()?,
                name: fields.cstr()?,
                value: fields.cstr()?,
            },
            ReplyCommand::ChangeHeader => Self::ChangeHeader {
                index: fields.u32()?,
                name: fields.cstr()?,
                value: fields.cstr()?,
            },
            ReplyCommand::ChangeSender => {
                let address = fields.cstr()?;
                let args = if fields.is_empty() {
                    None
                } else {
                    Some(fields.cstr()?)
                };
                Self::ChangeSender { address, args }
            }
            ReplyCommand::AddRecipient => Self::AddRecipient(fields.cstr()?),
            ReplyCommand::AddRecipientWithParams => Self::AddRecipientWithParams {
                address: fields.cstr()?,
                args: fields.cstr()?,
            },
            ReplyCommand::DeleteRecipient => Self::DeleteRecipient(fields.cstr()?),
            ReplyCommand::ReplaceBody => Self::ReplaceBody(packet.payload.clone()),
            ReplyCommand::Quarantine => Self::Quarantine(fields.cstr()?),
        };

        Ok(reply)
    }
}

fn put_cstr(buf: &mut BytesMut, value: &[u8]) {
    buf.extend_from_slice(value);
    buf.put_u8(0);
}

/// Cursor over a payload
struct Fields<'a> {
    command: &'static str,
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(command: &'static str, payload: &'a [u8]) -> Self {
        Self {
            command,
            rest: payload,
        }
    }

    fn malformed(&self, reason: &'static str) -> FrameError {
        FrameError::Malformed {
            command: self.command,
            reason,
        }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        let (&first, rest) = self
            .rest
            .split_first()
            .ok_or_else(|| self.malformed("truncated"))?;
        self.rest = rest;
        Ok(first)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        if self.rest.len() < 2 {
            return Err(self.malformed("truncated"));
        }
        let (head, rest) = self.rest.split_at(2);
        self.rest = rest;
        Ok(u16::from_be_bytes([head[0], head[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        if self.rest.len() < 4 {
            return Err(self.malformed("truncated"));
        }
        let (head, rest) = self.rest.split_at(4);
        self.rest = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn cstr(&mut self) -> Result<BString, FrameError> {
        let end = self
            .rest
            .find_byte(0)
            .ok_or_else(|| self.malformed("missing NUL terminator"))?;
        let value = BString::from(&self.rest[..end]);
        self.rest = &self.rest[end + 1..];
        Ok(value)
    }

    /// String the engine itself produced, so it must be valid UTF-8
    fn text(&mut self) -> Result<String, FrameError> {
        String::from_utf8(self.cstr()?.into()).map_err(|_| self.malformed("invalid UTF-8"))
    }

    fn envelope(&mut self) -> Result<(BString, Vec<BString>), FrameError> {
        if self.is_empty() {
            return Err(self.malformed("missing address"));
        }
        let address = self.cstr()?;
        let mut args = Vec::new();
        while !self.is_empty() {
            args.push(self.cstr()?);
        }
        Ok((address, args))
    }

    fn peer_addr(&mut self) -> Result<PeerAddr, FrameError> {
        let family = self.u8()?;
        if family == FAMILY_UNKNOWN {
            return Ok(PeerAddr::Unknown);
        }

        let port = self.u16()?;
        let address = self.cstr()?;
        match family {
            FAMILY_UNIX => Ok(PeerAddr::Unix(address)),
            FAMILY_INET => address
                .to_str()
                .ok()
                .and_then(|text| text.parse::<Ipv4Addr>().ok())
                .map(|ip| PeerAddr::V4(ip, port))
                .ok_or_else(|| self.malformed("invalid IPv4 address")),
            FAMILY_INET6 => address
                .to_str()
                .ok()
                .map(|text| text.strip_prefix("IPv6:").unwrap_or(text))
                .and_then(|text| text.parse::<Ipv6Addr>().ok())
                .map(|ip| PeerAddr::V6(ip, port))
                .ok_or_else(|| self.malformed("invalid IPv6 address")),
            _ => Err(self.malformed("unknown address family")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_roundtrip(message: AgentMessage) {
        let packet = message.to_packet();
        let decoded = AgentMessage::decode(&packet).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.to_packet().serialize(), packet.serialize());
    }

    fn reply_roundtrip(reply: FilterReply) {
        let packet = reply.to_packet();
        let decoded = FilterReply::decode(&packet).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.to_packet().serialize(), packet.serialize());
    }

    #[test]
    fn test_connect_inet_layout() {
        let packet = Packet::new(
            b'C',
            &b"mx.example.net\x004\x00\x19192.0.2.1\x00"[..],
        );
        match AgentMessage::decode(&packet).unwrap() {
            AgentMessage::Connect { hostname, address } => {
                assert_eq!(hostname, "mx.example.net");
                assert_eq!(address, PeerAddr::V4(Ipv4Addr::new(192, 0, 2, 1), 25));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_connect_ipv6_prefix_tolerated() {
        let packet = Packet::new(b'C', &b"h\x006\x01\xbbIPv6:2001:db8::1\x00"[..]);
        match AgentMessage::decode(&packet).unwrap() {
            AgentMessage::Connect { address, .. } => {
                assert_eq!(address, PeerAddr::V6("2001:db8::1".parse().unwrap(), 443));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_connect_families_roundtrip() {
        for address in [
            PeerAddr::Unknown,
            PeerAddr::Unix("/var/run/smtp.sock".into()),
            PeerAddr::V4(Ipv4Addr::LOCALHOST, 2525),
            PeerAddr::V6(Ipv6Addr::LOCALHOST, 587),
        ] {
            agent_roundtrip(AgentMessage::Connect {
                hostname: "client.example.org".into(),
                address,
            });
        }
    }

    #[test]
    fn test_agent_minimal_payloads_roundtrip() {
        agent_roundtrip(AgentMessage::Helo(None));
        agent_roundtrip(AgentMessage::Helo(Some(BString::default())));
        agent_roundtrip(AgentMessage::Mail {
            address: BString::default(),
            args: vec![],
        });
        agent_roundtrip(AgentMessage::Header {
            name: BString::default(),
            value: BString::default(),
        });
        agent_roundtrip(AgentMessage::Body(Bytes::new()));
        agent_roundtrip(AgentMessage::EndOfMessage(Bytes::new()));
        agent_roundtrip(AgentMessage::Unknown(BString::default()));
        agent_roundtrip(AgentMessage::Macros {
            stage: b'C',
            pairs: vec![],
        });
        for message in [
            AgentMessage::Data,
            AgentMessage::EndOfHeaders,
            AgentMessage::Abort,
            AgentMessage::Quit,
            AgentMessage::QuitNewConnection,
        ] {
            agent_roundtrip(message);
        }
    }

    #[test]
    fn test_agent_full_payloads_roundtrip() {
        agent_roundtrip(AgentMessage::Negotiate(OptionNegotiation {
            version: 6,
            actions: 0x1ff,
            steps: 0x001f_ffff,
        }));
        agent_roundtrip(AgentMessage::Recipient {
            address: "<rcpt@example.com>".into(),
            args: vec!["NOTIFY=NEVER".into(), "ORCPT=rfc822;x@example.com".into()],
        });
        agent_roundtrip(AgentMessage::Macros {
            stage: b'M',
            pairs: vec![
                ("i".into(), "4AbC12".into()),
                ("{mail_addr}".into(), "sender@example.com".into()),
            ],
        });
        agent_roundtrip(AgentMessage::Body(Bytes::from(vec![b'z'; 65535])));
    }

    #[test]
    fn test_eight_bit_strings_kept_verbatim() {
        let packet = Packet::new(b'L', &b"Subject\0Caf\xe9\0"[..]);
        let decoded = AgentMessage::decode(&packet).unwrap();
        match &decoded {
            AgentMessage::Header { name, value } => {
                assert_eq!(name, "Subject");
                assert_eq!(value.as_slice(), b"Caf\xe9");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(decoded.to_packet().serialize(), packet.serialize());

        let mail = Packet::new(b'M', &b"<j\xf6rg@example.com>\0BODY=8BITMIME\0"[..]);
        assert_eq!(
            AgentMessage::decode(&mail).unwrap().to_packet().serialize(),
            mail.serialize()
        );

        // A filter echoing the value back writes the same bytes
        if let AgentMessage::Header { name, value } = decoded {
            let echoed = FilterReply::ChangeHeader {
                index: 1,
                name,
                value,
            }
            .to_packet();
            assert_eq!(&echoed.payload[..], b"\x00\x00\x00\x01Subject\0Caf\xe9\0");
        }
    }

    #[test]
    fn test_body_at_largest_chunk_through_codec() {
        use crate::capabilities::CHUNK_SIZE_1M;
        use crate::proto::PacketCodec;
        use tokio_util::codec::{Decoder, Encoder};

        let message = AgentMessage::Body(Bytes::from(vec![0xa5; CHUNK_SIZE_1M]));
        let mut codec = PacketCodec::new(CHUNK_SIZE_1M);
        let mut buf = BytesMut::new();
        codec.encode(message.to_packet(), &mut buf).unwrap();
        let wire = buf.clone().freeze();

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        let decoded = AgentMessage::decode(&packet).unwrap();
        assert_eq!(decoded, message);

        let mut again = BytesMut::new();
        codec.encode(decoded.to_packet(), &mut again).unwrap();
        assert_eq!(again.freeze(), wire);
    }

    #[test]
    fn test_envelope_arguments_decoded_in_order() {
        let packet = Packet::new(b'M', &b"<a@example.com>\0SIZE=100\0BODY=8BITMIME\0"[..]);
        match AgentMessage::decode(&packet).unwrap() {
            AgentMessage::Mail { address, args } => {
                assert_eq!(address, "<a@example.com>");
                assert_eq!(args, vec!["SIZE=100", "BODY=8BITMIME"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let missing_nul = Packet::new(b'L', &b"Subject\0no terminator"[..]);
        assert!(matches!(
            AgentMessage::decode(&missing_nul),
            Err(FrameError::Malformed { command: "header", .. })
        ));

        let short_optneg = Packet::new(b'O', &[0u8, 0, 0, 6][..]);
        assert!(matches!(
            AgentMessage::decode(&short_optneg),
            Err(FrameError::Malformed { .. })
        ));

        let bad_family = Packet::new(b'C', &b"h\0X\0\0x\0"[..]);
        assert!(AgentMessage::decode(&bad_family).is_err());

        assert!(matches!(
            AgentMessage::decode(&Packet::empty(b'Z')),
            Err(FrameError::UnknownCommand(b'Z'))
        ));
    }

    #[test]
    fn test_replies_roundtrip() {
        reply_roundtrip(FilterReply::Negotiate {
            version: 6,
            actions: 0x1,
            steps: 0,
            symbol_lists: vec![],
        });
        reply_roundtrip(FilterReply::Negotiate {
            version: 6,
            actions: 0x101,
            steps: 0x400,
            symbol_lists: vec![(0, "{client_addr} j".into()), (2, "i".into())],
        });
        for reply in [
            FilterReply::Continue,
            FilterReply::Reject,
            FilterReply::Discard,
            FilterReply::Accept,
            FilterReply::Tempfail,
            FilterReply::Skip,
            FilterReply::Progress,
        ] {
            reply_roundtrip(reply);
        }
        reply_roundtrip(FilterReply::ReplyCode("550 5.7.1 go away".into()));
        let lines: Vec<String> = (0..crate::proto::MAX_REPLY_LINES)
            .map(|i| format!("policy line {i}"))
            .collect();
        let full = crate::proto::SmtpReply::multi_line("550", Some("5.7.1"), &lines).unwrap();
        reply_roundtrip(FilterReply::ReplyCode(full.text()));
        reply_roundtrip(FilterReply::AddHeader {
            name: "X-Spam".into(),
            value: "no".into(),
        });
        reply_roundtrip(FilterReply::InsertHeader {
            index: 0,
            name: "Received".into(),
            value: BString::default(),
        });
        reply_roundtrip(FilterReply::ChangeHeader {
            index: 2,
            name: "Subject".into(),
            value: BString::default(),
        });
        reply_roundtrip(FilterReply::ChangeSender {
            address: "<bounce@example.com>".into(),
            args: None,
        });
        reply_roundtrip(FilterReply::ChangeSender {
            address: "<bounce@example.com>".into(),
            args: Some("SIZE=10".into()),
        });
        reply_roundtrip(FilterReply::AddRecipient("<a@example.com>".into()));
        reply_roundtrip(FilterReply::AddRecipientWithParams {
            address: "<a@example.com>".into(),
            args: "NOTIFY=NEVER".into(),
        });
        reply_roundtrip(FilterReply::DeleteRecipient("<b@example.com>".into()));
        reply_roundtrip(FilterReply::ReplaceBody(Bytes::new()));
        reply_roundtrip(FilterReply::ReplaceBody(Bytes::from(vec![0u8; 65535])));
        reply_roundtrip(FilterReply::Quarantine("suspicious".into()));
    }

    #[test]
    fn test_change_header_layout() {
        let packet = FilterReply::ChangeHeader {
            index: 1,
            name: "Subject".into(),
            value: "[spam]".into(),
        }
        .to_packet();
        assert_eq!(packet.command, b'm');
        assert_eq!(&packet.payload[..], b"\x00\x00\x00\x01Subject\0[spam]\0");
    }
}
