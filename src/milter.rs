//! The filter side: handler trait, verdicts and the registry the engine
//! dispatches through.

use async_trait::async_trait;
use bstr::{BStr, BString};
use std::fmt;

use crate::capabilities::{ActionSet, StepSet};
use crate::negotiate::{NegotiationOutcome, Offer};
use crate::proto::PeerAddr;
use crate::session::{Session, Stage};

/// Answer of a stage handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Carry on with the next stage
    Continue,
    /// Reject the command (or the recipient, at the recipient stage)
    Reject,
    /// Accept the message but silently drop it
    Discard,
    /// Accept the message without further filtering
    Accept,
    /// Temporary failure
    Tempfail,
    /// Send nothing; only legal for stages negotiated as no-reply
    NoReply,
    /// Skip the rest of the body; only legal at the body stage
    Skip,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Continue => "continue",
            Self::Reject => "reject",
            Self::Discard => "discard",
            Self::Accept => "accept",
            Self::Tempfail => "tempfail",
            Self::NoReply => "no-reply",
            Self::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// Stage handlers of a filter.
///
/// Every stage except end of message has a default that continues. Handlers
/// get the session for macro lookups, their per-connection context and,
/// at end of message, the modification methods. Strings from the agent are
/// passed exactly as received and need not be UTF-8.
#[async_trait]
pub trait Milter: Send + Sync + 'static {
    /// Per-connection state, owned by the session
    type Context: Send + 'static;

    /// Called once per connection with the agent's offer. `None` keeps the
    /// engine defaults.
    async fn negotiate(
        &self,
        _session: &mut Session<Self::Context>,
        _offer: &Offer,
    ) -> Option<NegotiationOutcome> {
        None
    }

    async fn connect(
        &self,
        _session: &mut Session<Self::Context>,
        _hostname: &BStr,
        _address: &PeerAddr,
    ) -> Verdict {
        Verdict::Continue
    }

    async fn helo(&self, _session: &mut Session<Self::Context>, _name: Option<&BStr>) -> Verdict {
        Verdict::Continue
    }

    async fn envelope_from(
        &self,
        _session: &mut Session<Self::Context>,
        _address: &BStr,
        _args: &[BString],
    ) -> Verdict {
        Verdict::Continue
    }

    async fn envelope_recipient(
        &self,
        _session: &mut Session<Self::Context>,
        _address: &BStr,
        _args: &[BString],
    ) -> Verdict {
        Verdict::Continue
    }

    async fn data(&self, _session: &mut Session<Self::Context>) -> Verdict {
        Verdict::Continue
    }

    async fn header(
        &self,
        _session: &mut Session<Self::Context>,
        _name: &BStr,
        _value: &BStr,
    ) -> Verdict {
        Verdict::Continue
    }

    async fn end_of_headers(&self, _session: &mut Session<Self::Context>) -> Verdict {
        Verdict::Continue
    }

    /// `chunk` is only valid for the duration of the call
    async fn body(&self, _session: &mut Session<Self::Context>, _chunk: &[u8]) -> Verdict {
        Verdict::Continue
    }

    async fn end_of_message(&self, session: &mut Session<Self::Context>) -> Verdict;

    async fn abort(&self, _session: &mut Session<Self::Context>) {}

    async fn close(&self, _session: &mut Session<Self::Context>) {}

    async fn unknown(&self, _session: &mut Session<Self::Context>, _command: &BStr) -> Verdict {
        Verdict::Continue
    }
}

/// Stages that can be registered individually
const OPTIONAL_STAGES: [Stage; 9] = [
    Stage::Connect,
    Stage::Helo,
    Stage::Mail,
    Stage::Recipient,
    Stage::Data,
    Stage::Header,
    Stage::EndOfHeaders,
    Stage::Body,
    Stage::Unknown,
];

/// A filter together with what it is registered for. Built once and
/// shared by every connection.
pub struct Registry<M> {
    name: String,
    milter: M,
    actions: ActionSet,
    stages: Option<Vec<Stage>>,
}

impl<M: Milter> Registry<M> {
    /// Registry calling every handler, with no modification actions
    pub fn new(name: impl Into<String>, milter: M) -> Self {
        Self {
            name: name.into(),
            milter,
            actions: ActionSet::empty(),
            stages: None,
        }
    }

    /// Actions to request when the filter has no negotiation handler
    pub fn with_actions(mut self, actions: ActionSet) -> Self {
        self.actions = actions;
        self
    }

    /// Only call handlers for `stages`; other optional stages get the
    /// default verdict. End of message, abort and close are always called.
    pub fn handling(mut self, stages: &[Stage]) -> Self {
        self.stages = Some(stages.to_vec());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn milter(&self) -> &M {
        &self.milter
    }

    pub fn actions(&self) -> ActionSet {
        self.actions
    }

    pub fn handles(&self, stage: Stage) -> bool {
        match &self.stages {
            Some(stages) if OPTIONAL_STAGES.contains(&stage) => stages.contains(&stage),
            _ => true,
        }
    }

    /// Skip flags for every optional stage without a handler
    pub fn unhandled_skip_steps(&self) -> StepSet {
        OPTIONAL_STAGES
            .iter()
            .filter(|stage| !self.handles(**stage))
            .filter_map(|stage| stage.skip_step())
            .collect()
    }
}
