//! Per-session macro (symbol) table.
//!
//! The agent sends macro definitions ahead of the stage they belong to. Each
//! stage owns one slot; a new definition for a stage replaces its slot.
//! Lookups search the most recent stage first.

use bstr::{BStr, BString, ByteSlice};
use std::fmt;

/// Stage a group of macros belongs to. The numeric code is the one used in
/// symbol-list requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    Mail = 2,
    Recipient = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeaders = 6,
}

impl MacroStage {
    /// Most recent stage first
    const LOOKUP_ORDER: [MacroStage; 7] = [
        Self::EndOfMessage,
        Self::EndOfHeaders,
        Self::Data,
        Self::Recipient,
        Self::Mail,
        Self::Helo,
        Self::Connect,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map the command byte carried in a macro packet
    pub fn from_command(command: u8) -> Option<Self> {
        match command {
            b'C' => Some(Self::Connect),
            b'H' => Some(Self::Helo),
            b'M' => Some(Self::Mail),
            b'R' => Some(Self::Recipient),
            b'T' => Some(Self::Data),
            b'N' => Some(Self::EndOfHeaders),
            b'E' => Some(Self::EndOfMessage),
            _ => None,
        }
    }

    /// Stages whose macros only live for one message
    pub fn is_message_scoped(self) -> bool {
        !matches!(self, Self::Connect | Self::Helo)
    }
}

impl fmt::Display for MacroStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::Mail => "mail",
            Self::Recipient => "rcpt",
            Self::Data => "data",
            Self::EndOfMessage => "end-of-message",
            Self::EndOfHeaders => "end-of-headers",
        };
        f.write_str(name)
    }
}

/// Symbol table for one session
#[derive(Debug, Default, Clone)]
pub struct MacroStore {
    slots: [Vec<(BString, BString)>; 7],
}

impl MacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the definitions of `stage`
    pub fn define(&mut self, stage: MacroStage, pairs: Vec<(BString, BString)>) {
        self.slots[stage as usize] = pairs;
    }

    /// Look up a symbol. `x` and `{x}` name the same symbol.
    pub fn get(&self, name: &str) -> Option<&BStr> {
        let wanted = strip_braces(name.as_bytes());
        MacroStage::LOOKUP_ORDER.iter().find_map(|stage| {
            self.slots[*stage as usize]
                .iter()
                .find(|(key, _)| strip_braces(key) == wanted)
                .map(|(_, value)| value.as_bstr())
        })
    }

    /// Definitions received for one stage
    pub fn stage(&self, stage: MacroStage) -> &[(BString, BString)] {
        &self.slots[stage as usize]
    }

    /// Forget everything tied to the current message
    pub fn clear_message(&mut self) {
        for stage in MacroStage::LOOKUP_ORDER {
            if stage.is_message_scoped() {
                self.slots[stage as usize].clear();
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}

fn strip_braces(name: &[u8]) -> &[u8] {
    name.strip_prefix(b"{")
        .and_then(|inner| inner.strip_suffix(b"}"))
        .unwrap_or(name)
}
