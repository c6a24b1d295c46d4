//! Per-connection session: protocol phase, negotiated capabilities, macros,
//! the handler's context and the end-of-message modification queue.

use bstr::{BStr, BString};
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::capabilities::{Action, ActionSet, StepSet};
use crate::macros::{MacroStage, MacroStore};
use crate::negotiate::Negotiated;
use crate::proto::{FilterReply, SmtpReply};
use crate::{Error, Result};

/// Kind of packet being processed, as seen by handlers and in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Negotiate,
    Macro,
    Connect,
    Helo,
    Mail,
    Recipient,
    Data,
    Header,
    EndOfHeaders,
    Body,
    EndOfMessage,
    Abort,
    Unknown,
    Close,
}

impl Stage {
    /// Step flag that tells the agent not to send this stage at all
    pub fn skip_step(self) -> Option<StepSet> {
        match self {
            Self::Connect => Some(StepSet::NO_CONNECT),
            Self::Helo => Some(StepSet::NO_HELO),
            Self::Mail => Some(StepSet::NO_MAIL),
            Self::Recipient => Some(StepSet::NO_RECIPIENT),
            Self::Data => Some(StepSet::NO_DATA),
            Self::Header => Some(StepSet::NO_HEADERS),
            Self::EndOfHeaders => Some(StepSet::NO_END_OF_HEADERS),
            Self::Body => Some(StepSet::NO_BODY),
            Self::Unknown => Some(StepSet::NO_UNKNOWN),
            _ => None,
        }
    }

    /// Step flag that tells the agent not to wait for a reply to this stage
    pub fn no_reply_step(self) -> Option<StepSet> {
        match self {
            Self::Connect => Some(StepSet::NO_REPLY_CONNECT),
            Self::Helo => Some(StepSet::NO_REPLY_HELO),
            Self::Mail => Some(StepSet::NO_REPLY_MAIL),
            Self::Recipient => Some(StepSet::NO_REPLY_RECIPIENT),
            Self::Data => Some(StepSet::NO_REPLY_DATA),
            Self::Header => Some(StepSet::NO_REPLY_HEADER),
            Self::EndOfHeaders => Some(StepSet::NO_REPLY_END_OF_HEADERS),
            Self::Body => Some(StepSet::NO_REPLY_BODY),
            Self::Unknown => Some(StepSet::NO_REPLY_UNKNOWN),
            _ => None,
        }
    }

    /// Phase the session enters once this stage was accepted
    fn phase(self) -> Option<Phase> {
        match self {
            Self::Connect => Some(Phase::Connect),
            Self::Helo => Some(Phase::Helo),
            Self::Mail => Some(Phase::Mail),
            Self::Recipient => Some(Phase::Recipient),
            Self::Data => Some(Phase::Data),
            Self::Header => Some(Phase::Header),
            Self::EndOfHeaders => Some(Phase::EndOfHeaders),
            Self::Body => Some(Phase::Body),
            Self::EndOfMessage => Some(Phase::EndOfMessage),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiate => "negotiate",
            Self::Macro => "macro",
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::Mail => "mail",
            Self::Recipient => "rcpt",
            Self::Data => "data",
            Self::Header => "header",
            Self::EndOfHeaders => "end-of-headers",
            Self::Body => "body",
            Self::EndOfMessage => "end-of-message",
            Self::Abort => "abort",
            Self::Unknown => "unknown",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Where the session is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing received yet
    AwaitingNegotiation,
    /// Negotiated, waiting for the next SMTP client
    Ready,
    Connect,
    Helo,
    Mail,
    Recipient,
    Data,
    Header,
    EndOfHeaders,
    Body,
    EndOfMessage,
    Closed,
}

impl Phase {
    /// Stages the agent may send next from this phase
    fn next_stages(self) -> &'static [Stage] {
        use Stage::*;
        match self {
            Self::AwaitingNegotiation | Self::Closed => &[],
            Self::Ready => &[Connect],
            Self::Connect | Self::Helo => &[Helo, Mail],
            Self::Mail => &[Recipient],
            Self::Recipient => &[Recipient, Data, Header, EndOfHeaders, EndOfMessage],
            Self::Data => &[Header, EndOfHeaders, EndOfMessage],
            Self::Header => &[Header, EndOfHeaders],
            Self::EndOfHeaders | Self::Body => &[Body, EndOfMessage],
            Self::EndOfMessage => &[Mail],
        }
    }

    pub fn is_negotiated(self) -> bool {
        !matches!(self, Self::AwaitingNegotiation | Self::Closed)
    }

    /// Whether an SMTP client is connected (connect seen or skipped)
    fn in_connection(self) -> bool {
        !matches!(self, Self::AwaitingNegotiation | Self::Ready | Self::Closed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingNegotiation => "awaiting-negotiation",
            Self::Ready => "ready",
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::Mail => "mail",
            Self::Recipient => "rcpt",
            Self::Data => "data",
            Self::Header => "header",
            Self::EndOfHeaders => "end-of-headers",
            Self::Body => "body",
            Self::EndOfMessage => "end-of-message",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State of one agent connection, handed to every handler call.
///
/// The handler context `C` is owned here and dropped when the session is
/// dropped or the agent starts over with a new SMTP client.
pub struct Session<C> {
    id: u64,
    phase: Phase,
    stage: Option<Stage>,
    negotiated: Option<Negotiated>,
    macros: MacroStore,
    context: Option<C>,
    modifications: Vec<FilterReply>,
    reply: Option<SmtpReply>,
    progress: Option<mpsc::UnboundedSender<()>>,
    deadline: Option<Instant>,
}

impl<C> Session<C> {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            phase: Phase::AwaitingNegotiation,
            stage: None,
            negotiated: None,
            macros: MacroStore::new(),
            context: None,
            modifications: Vec::new(),
            reply: None,
            progress: None,
            deadline: None,
        }
    }

    /// Session with a channel the connection loop drains for progress
    /// requests
    pub(crate) fn with_progress(id: u64, progress: mpsc::UnboundedSender<()>) -> Self {
        let mut session = Self::new(id);
        session.progress = Some(progress);
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Stage whose handler is currently running
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn actions(&self) -> ActionSet {
        self.negotiated
            .as_ref()
            .map_or(ActionSet::empty(), |n| n.actions)
    }

    pub fn steps(&self) -> StepSet {
        self.negotiated
            .as_ref()
            .map_or(StepSet::empty(), |n| n.steps)
    }

    /// Value of a macro sent by the agent, `None` if it was never sent
    pub fn symbol(&self, name: &str) -> Option<&BStr> {
        self.macros.get(name)
    }

    pub fn macros(&self) -> &MacroStore {
        &self.macros
    }

    /// When the agent gives up waiting for the current stage
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn context(&self) -> Option<&C> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut C> {
        self.context.as_mut()
    }

    /// Store a context, returning the previous one
    pub fn set_context(&mut self, context: C) -> Option<C> {
        self.context.replace(context)
    }

    pub fn take_context(&mut self) -> Option<C> {
        self.context.take()
    }

    /// SMTP reply used if the current stage ends in reject or tempfail
    pub fn set_reply(&mut self, reply: SmtpReply) {
        self.reply = Some(reply);
    }

    // Modification arguments are raw bytes; agent values pass through as is.

    pub fn add_header(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.check_modification(Action::AddHeader, "add header")?;
        let name = header_name(name.as_ref())?;
        self.queue(FilterReply::AddHeader {
            name,
            value: BString::from(value.as_ref()),
        });
        Ok(())
    }

    /// Insert a header at `index` (0 is the top of the header block)
    pub fn insert_header(
        &mut self,
        index: u32,
        name: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.check_modification(Action::AddHeader, "insert header")?;
        let name = header_name(name.as_ref())?;
        self.queue(FilterReply::InsertHeader {
            index,
            name,
            value: BString::from(value.as_ref()),
        });
        Ok(())
    }

    /// Change the `index`th occurrence (1-based) of header `name`
    pub fn change_header(
        &mut self,
        name: impl AsRef<[u8]>,
        index: u32,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.check_modification(Action::ChangeHeader, "change header")?;
        let name = header_name(name.as_ref())?;
        self.queue(FilterReply::ChangeHeader {
            index,
            name,
            value: BString::from(value.as_ref()),
        });
        Ok(())
    }

    pub fn delete_header(&mut self, name: impl AsRef<[u8]>, index: u32) -> Result<()> {
        self.change_header(name, index, "")
    }

    pub fn change_sender(&mut self, address: impl AsRef<[u8]>, args: Option<&[u8]>) -> Result<()> {
        self.check_modification(Action::ChangeSender, "change sender")?;
        let address = envelope_address(address.as_ref())?;
        self.queue(FilterReply::ChangeSender {
            address,
            args: args.map(BString::from),
        });
        Ok(())
    }

    pub fn add_recipient(&mut self, address: impl AsRef<[u8]>) -> Result<()> {
        self.check_modification(Action::AddRecipient, "add recipient")?;
        let address = envelope_address(address.as_ref())?;
        self.queue(FilterReply::AddRecipient(address));
        Ok(())
    }

    pub fn add_recipient_with_params(
        &mut self,
        address: impl AsRef<[u8]>,
        args: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.check_modification(Action::AddRecipientWithParams, "add recipient")?;
        let address = envelope_address(address.as_ref())?;
        self.queue(FilterReply::AddRecipientWithParams {
            address,
            args: BString::from(args.as_ref()),
        });
        Ok(())
    }

    pub fn delete_recipient(&mut self, address: impl AsRef<[u8]>) -> Result<()> {
        self.check_modification(Action::DeleteRecipient, "delete recipient")?;
        let address = envelope_address(address.as_ref())?;
        self.queue(FilterReply::DeleteRecipient(address));
        Ok(())
    }

    /// Append to the replacement body. Repeated calls concatenate; the data
    /// is split into chunks the agent accepts.
    pub fn replace_body(&mut self, body: &[u8]) -> Result<()> {
        self.check_modification(Action::ChangeBody, "replace body")?;
        let chunk_size = self
            .negotiated
            .as_ref()
            .map(Negotiated::max_chunk_size)
            .unwrap_or(crate::proto::DEFAULT_CHUNK_SIZE);
        if body.is_empty() {
            self.queue(FilterReply::ReplaceBody(Bytes::new()));
        }
        for chunk in body.chunks(chunk_size) {
            self.queue(FilterReply::ReplaceBody(Bytes::copy_from_slice(chunk)));
        }
        Ok(())
    }

    pub fn quarantine(&mut self, reason: impl AsRef<[u8]>) -> Result<()> {
        self.check_modification(Action::Quarantine, "quarantine")?;
        let reason = reason.as_ref();
        if reason.is_empty() {
            return Err(Error::InvalidArgument("quarantine reason is empty"));
        }
        self.queue(FilterReply::Quarantine(BString::from(reason)));
        Ok(())
    }

    /// Ask the agent to extend its timeout while end of message is still
    /// being processed
    pub fn progress(&mut self) -> Result<()> {
        self.check_end_of_message("progress")?;
        if let Some(progress) = &self.progress {
            // Receiver only goes away with the connection
            let _ = progress.send(());
        }
        Ok(())
    }

    fn check_modification(&self, action: Action, operation: &'static str) -> Result<()> {
        if !self.actions().contains(action.into()) {
            return Err(Error::Capability { action });
        }
        self.check_end_of_message(operation)
    }

    fn check_end_of_message(&self, operation: &'static str) -> Result<()> {
        match self.stage {
            Some(Stage::EndOfMessage) => Ok(()),
            stage => Err(Error::ModificationOutsideEndOfMessage {
                operation,
                stage: stage.unwrap_or(Stage::Negotiate),
            }),
        }
    }

    fn queue(&mut self, modification: FilterReply) {
        trace!("Session {}: queued {:?}", self.id, modification.command());
        self.modifications.push(modification);
    }

    // Engine side

    pub(crate) fn set_negotiated(&mut self, negotiated: Negotiated) {
        self.negotiated = Some(negotiated);
        self.phase = Phase::Ready;
    }

    pub(crate) fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub(crate) fn define_macros(&mut self, stage: MacroStage, pairs: Vec<(BString, BString)>) {
        self.macros.define(stage, pairs);
    }

    pub(crate) fn begin_stage(&mut self, stage: Stage) {
        self.stage = Some(stage);
    }

    pub(crate) fn end_stage(&mut self) {
        self.stage = None;
    }

    pub(crate) fn take_reply(&mut self) -> Option<SmtpReply> {
        self.reply.take()
    }

    pub(crate) fn take_modifications(&mut self) -> Vec<FilterReply> {
        std::mem::take(&mut self.modifications)
    }

    fn skipped(&self, stage: Stage) -> bool {
        stage
            .skip_step()
            .is_some_and(|step| self.steps().contains(step))
    }

    /// Check that `stage` may follow the current phase.
    ///
    /// Stages the agent was told to skip are never legal themselves but are
    /// transparent: they may be stepped over to reach `stage`.
    pub(crate) fn check_order(&self, stage: Stage) -> Result<()> {
        let order_error = Err(Error::ProtocolOrder {
            stage,
            phase: self.phase,
        });

        if self.skipped(stage) {
            return order_error;
        }

        let allowed = match stage {
            Stage::Negotiate => self.phase == Phase::AwaitingNegotiation,
            Stage::Macro | Stage::Unknown => self.phase.is_negotiated(),
            Stage::Close => true,
            Stage::Abort => {
                self.phase.in_connection()
                    || (self.phase == Phase::Ready && self.skipped(Stage::Connect))
            }
            _ => self.reachable(stage),
        };

        if allowed { Ok(()) } else { order_error }
    }

    fn reachable(&self, target: Stage) -> bool {
        let mut visited: Vec<Phase> = Vec::new();
        let mut pending = vec![self.phase];
        while let Some(phase) = pending.pop() {
            if visited.contains(&phase) {
                continue;
            }
            visited.push(phase);
            for next in phase.next_stages() {
                if *next == target {
                    return true;
                }
                if self.skipped(*next) {
                    if let Some(phase) = next.phase() {
                        pending.push(phase);
                    }
                }
            }
        }
        false
    }

    /// Check ordering and move to the phase `stage` leads to
    pub(crate) fn advance(&mut self, stage: Stage) -> Result<()> {
        self.check_order(stage)?;
        if let Some(phase) = stage.phase() {
            self.phase = phase;
        }
        Ok(())
    }

    /// Message finished: forget message scoped state
    pub(crate) fn end_message(&mut self) {
        self.macros.clear_message();
        self.modifications.clear();
        self.reply = None;
    }

    /// Agent aborted the current message; ready for a new envelope sender
    pub(crate) fn abort_message(&mut self) {
        self.end_message();
        self.phase = Phase::Helo;
    }

    /// Agent moved on to a new SMTP client over this connection
    pub(crate) fn reset_connection(&mut self) {
        self.end_message();
        self.macros.clear();
        self.context = None;
        self.phase = Phase::Ready;
    }

    pub(crate) fn close(&mut self) {
        self.end_message();
        self.context = None;
        self.phase = Phase::Closed;
    }
}

impl<C> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("stage", &self.stage)
            .field("negotiated", &self.negotiated)
            .field("has_context", &self.context.is_some())
            .field("queued", &self.modifications.len())
            .finish()
    }
}

fn header_name(name: &[u8]) -> Result<BString> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("header name is empty"));
    }
    Ok(BString::from(name))
}

fn envelope_address(address: &[u8]) -> Result<BString> {
    if address.is_empty() {
        return Err(Error::InvalidArgument("address is empty"));
    }
    Ok(BString::from(address))
}
