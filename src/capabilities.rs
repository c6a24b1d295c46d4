//! Translation between the agent's 32-bit masks and typed capability sets.
//!
//! Two disjoint namespaces exist: [`ActionSet`] for what the filter may do
//! to a message, and [`StepSet`] for which packets the agent sends and which
//! replies it waits for. The flag tables below are the only place the wire
//! bits are spelled out.

use std::fmt;
use tracing::warn;

use crate::proto::frames::DEFAULT_CHUNK_SIZE;

/// Body chunk limit when the agent negotiated 256K packets
pub const CHUNK_SIZE_256K: usize = 262_143;

/// Body chunk limit when the agent negotiated 1M packets
pub const CHUNK_SIZE_1M: usize = 1_048_575;

bitflags::bitflags! {
    /// Message modifications the filter may request at end of message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ActionSet: u32 {
        const ADD_HEADER = 0x01;
        const CHANGE_BODY = 0x02;
        const ADD_RECIPIENT = 0x04;
        const DELETE_RECIPIENT = 0x08;
        const CHANGE_HEADER = 0x10;
        const QUARANTINE = 0x20;
        const CHANGE_SENDER = 0x40;
        const ADD_RECIPIENT_WITH_PARAMS = 0x80;
        const SET_SYMBOL_LIST = 0x100;
    }
}

bitflags::bitflags! {
    /// Protocol steps: stages to skip, stages without a reply and protocol
    /// extensions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepSet: u32 {
        const NO_CONNECT = 0x0000_0001;
        const NO_HELO = 0x0000_0002;
        const NO_MAIL = 0x0000_0004;
        const NO_RECIPIENT = 0x0000_0008;
        const NO_BODY = 0x0000_0010;
        const NO_HEADERS = 0x0000_0020;
        const NO_END_OF_HEADERS = 0x0000_0040;
        const NO_REPLY_HEADER = 0x0000_0080;
        const NO_UNKNOWN = 0x0000_0100;
        const NO_DATA = 0x0000_0200;
        /// Agent understands the skip verdict
        const SKIP = 0x0000_0400;
        /// Agent also sends recipients it already rejected
        const RECIPIENT_REJECTED = 0x0000_0800;
        const NO_REPLY_CONNECT = 0x0000_1000;
        const NO_REPLY_HELO = 0x0000_2000;
        const NO_REPLY_MAIL = 0x0000_4000;
        const NO_REPLY_RECIPIENT = 0x0000_8000;
        const NO_REPLY_DATA = 0x0001_0000;
        const NO_REPLY_UNKNOWN = 0x0002_0000;
        const NO_REPLY_END_OF_HEADERS = 0x0004_0000;
        const NO_REPLY_BODY = 0x0008_0000;
        /// Header values keep their leading whitespace
        const HEADER_LEADING_SPACE = 0x0010_0000;
        const MAX_DATA_SIZE_256K = 0x1000_0000;
        const MAX_DATA_SIZE_1M = 0x2000_0000;
    }
}

fn warn_unknown(kind: &str, mask: u32, known: u32) {
    let unknown = mask & !known;
    if unknown != 0 {
        warn!("Ignoring unknown {} bits {:#010x}", kind, unknown);
    }
}

impl ActionSet {
    /// Decode a wire mask. Unknown bits are dropped.
    pub fn from_mask(mask: u32) -> Self {
        warn_unknown("action", mask, Self::all().bits());
        Self::from_bits_truncate(mask)
    }
}

impl StepSet {
    /// Decode a wire mask. Unknown bits are dropped.
    pub fn from_mask(mask: u32) -> Self {
        warn_unknown("protocol step", mask, Self::all().bits());
        Self::from_bits_truncate(mask)
    }

    /// Largest body chunk either side may send under these steps
    pub fn max_chunk_size(&self) -> usize {
        if self.contains(Self::MAX_DATA_SIZE_1M) {
            CHUNK_SIZE_1M
        } else if self.contains(Self::MAX_DATA_SIZE_256K) {
            CHUNK_SIZE_256K
        } else {
            DEFAULT_CHUNK_SIZE
        }
    }
}

/// A single modification action, as named in capability errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    AddHeader,
    ChangeHeader,
    ChangeBody,
    AddRecipient,
    AddRecipientWithParams,
    DeleteRecipient,
    Quarantine,
    ChangeSender,
    SetSymbolList,
}

impl From<Action> for ActionSet {
    fn from(action: Action) -> ActionSet {
        match action {
            Action::AddHeader => ActionSet::ADD_HEADER,
            Action::ChangeHeader => ActionSet::CHANGE_HEADER,
            Action::ChangeBody => ActionSet::CHANGE_BODY,
            Action::AddRecipient => ActionSet::ADD_RECIPIENT,
            Action::AddRecipientWithParams => ActionSet::ADD_RECIPIENT_WITH_PARAMS,
            Action::DeleteRecipient => ActionSet::DELETE_RECIPIENT,
            Action::Quarantine => ActionSet::QUARANTINE,
            Action::ChangeSender => ActionSet::CHANGE_SENDER,
            Action::SetSymbolList => ActionSet::SET_SYMBOL_LIST,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddHeader => "add header",
            Self::ChangeHeader => "change header",
            Self::ChangeBody => "change body",
            Self::AddRecipient => "add recipient",
            Self::AddRecipientWithParams => "add recipient with parameters",
            Self::DeleteRecipient => "delete recipient",
            Self::Quarantine => "quarantine",
            Self::ChangeSender => "change sender",
            Self::SetSymbolList => "set symbol list",
        };
        f.write_str(name)
    }
}
