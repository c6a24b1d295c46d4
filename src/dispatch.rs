//! Turns decoded agent messages into handler calls and handler verdicts into
//! replies.

use bstr::ByteSlice;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::capabilities::StepSet;
use crate::macros::MacroStage;
use crate::milter::{Milter, Registry, Verdict};
use crate::negotiate::{negotiate, Offer};
use crate::proto::{AgentMessage, FilterReply, SmtpReply};
use crate::session::{Session, Stage};
use crate::{Error, Result};

/// What to send back for one agent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write these packets in order
    Replies(Vec<FilterReply>),
    /// Nothing to write
    Silent,
    /// The agent closed the session
    Close,
}

/// Drives one session through a [`Registry`]
pub struct Dispatcher<M: Milter> {
    registry: Arc<Registry<M>>,
    session: Session<M::Context>,
    skip_unhandled_stages: bool,
    client_open: bool,
}

impl<M: Milter> Dispatcher<M> {
    pub fn new(registry: Arc<Registry<M>>, session: Session<M::Context>) -> Self {
        Self {
            registry,
            session,
            skip_unhandled_stages: false,
            client_open: false,
        }
    }

    /// Without a negotiation handler, ask the agent to skip stages the
    /// registry has no handler for
    pub fn skip_unhandled_stages(mut self, enabled: bool) -> Self {
        self.skip_unhandled_stages = enabled;
        self
    }

    pub fn session(&self) -> &Session<M::Context> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<M::Context> {
        &mut self.session
    }

    /// Process one message. Errors are fatal to the connection except
    /// where [`Error::is_connection_fatal`] says otherwise.
    pub async fn dispatch(&mut self, message: AgentMessage) -> Result<Outcome> {
        let registry = Arc::clone(&self.registry);
        let milter = registry.milter();
        trace!(
            "Session {}: {} in phase {}",
            self.session.id(),
            message.command(),
            self.session.phase()
        );

        match message {
            AgentMessage::Negotiate(raw) => {
                if self.session.check_order(Stage::Negotiate).is_err() {
                    return Err(Error::Negotiation(format!(
                        "repeated negotiation in phase {}",
                        self.session.phase()
                    )));
                }
                let offer = Offer::from_wire(raw)?;

                self.session.begin_stage(Stage::Negotiate);
                let outcome = milter.negotiate(&mut self.session, &offer).await;
                self.session.end_stage();

                let default_steps = if self.skip_unhandled_stages {
                    registry.unhandled_skip_steps()
                } else {
                    StepSet::empty()
                };
                let (negotiated, reply) =
                    negotiate(&offer, outcome, registry.actions(), default_steps)?;
                self.session.set_negotiated(negotiated);
                self.client_open = true;
                Ok(Outcome::Replies(vec![reply]))
            }

            AgentMessage::Macros { stage, pairs } => {
                self.session.check_order(Stage::Macro)?;
                match MacroStage::from_command(stage) {
                    Some(stage) => self.session.define_macros(stage, pairs),
                    None => debug!(
                        "Session {}: ignoring macros for command {:?}",
                        self.session.id(),
                        stage as char
                    ),
                }
                Ok(Outcome::Silent)
            }

            AgentMessage::Connect { hostname, address } => {
                let verdict = if self.enter(Stage::Connect)? {
                    milter
                        .connect(&mut self.session, hostname.as_bstr(), &address)
                        .await
                } else {
                    Verdict::Continue
                };
                debug!(
                    "Session {}: connect from {} [{}]: {}",
                    self.session.id(),
                    hostname,
                    address,
                    verdict
                );
                self.respond(Stage::Connect, verdict)
            }

            AgentMessage::Helo(name) => {
                let verdict = if self.enter(Stage::Helo)? {
                    milter
                        .helo(&mut self.session, name.as_ref().map(|n| n.as_bstr()))
                        .await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Helo, verdict)
            }

            AgentMessage::Mail { address, args } => {
                let verdict = if self.enter(Stage::Mail)? {
                    milter
                        .envelope_from(&mut self.session, address.as_bstr(), &args)
                        .await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Mail, verdict)
            }

            AgentMessage::Recipient { address, args } => {
                let verdict = if self.enter(Stage::Recipient)? {
                    milter
                        .envelope_recipient(&mut self.session, address.as_bstr(), &args)
                        .await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Recipient, verdict)
            }

            AgentMessage::Data => {
                let verdict = if self.enter(Stage::Data)? {
                    milter.data(&mut self.session).await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Data, verdict)
            }

            AgentMessage::Header { name, value } => {
                let verdict = if self.enter(Stage::Header)? {
                    milter
                        .header(&mut self.session, name.as_bstr(), value.as_bstr())
                        .await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Header, verdict)
            }

            AgentMessage::EndOfHeaders => {
                let verdict = if self.enter(Stage::EndOfHeaders)? {
                    milter.end_of_headers(&mut self.session).await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::EndOfHeaders, verdict)
            }

            AgentMessage::Body(chunk) => {
                let verdict = if self.enter(Stage::Body)? {
                    milter.body(&mut self.session, &chunk).await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Body, verdict)
            }

            AgentMessage::EndOfMessage(chunk) => {
                self.session.advance(Stage::EndOfMessage)?;

                if !chunk.is_empty() && registry.handles(Stage::Body) {
                    self.session.begin_stage(Stage::Body);
                    let verdict = milter.body(&mut self.session, &chunk).await;
                    self.session.end_stage();
                    if !matches!(verdict, Verdict::Continue | Verdict::Skip | Verdict::NoReply) {
                        // The final chunk already decided the message
                        return self.finish_message(verdict);
                    }
                }

                self.session.begin_stage(Stage::EndOfMessage);
                let verdict = milter.end_of_message(&mut self.session).await;
                debug!(
                    "Session {}: end of message: {}",
                    self.session.id(),
                    verdict
                );
                self.finish_message(verdict)
            }

            AgentMessage::Abort => {
                self.session.check_order(Stage::Abort)?;
                self.session.begin_stage(Stage::Abort);
                milter.abort(&mut self.session).await;
                self.session.end_stage();
                self.session.abort_message();
                Ok(Outcome::Silent)
            }

            AgentMessage::Unknown(line) => {
                let verdict = if self.enter(Stage::Unknown)? {
                    milter.unknown(&mut self.session, line.as_bstr()).await
                } else {
                    Verdict::Continue
                };
                self.respond(Stage::Unknown, verdict)
            }

            AgentMessage::QuitNewConnection => {
                if !self.session.phase().is_negotiated() {
                    return Err(Error::ProtocolOrder {
                        stage: Stage::Close,
                        phase: self.session.phase(),
                    });
                }
                self.run_close().await;
                self.session.reset_connection();
                self.client_open = true;
                Ok(Outcome::Silent)
            }

            AgentMessage::Quit => {
                self.finish().await;
                Ok(Outcome::Close)
            }
        }
    }

    /// Run the close handler if it has not run for the current client and
    /// close the session. Called on every way out of a connection.
    pub async fn finish(&mut self) {
        self.run_close().await;
        self.session.close();
    }

    async fn run_close(&mut self) {
        if !self.client_open {
            return;
        }
        self.client_open = false;
        self.session.begin_stage(Stage::Close);
        self.registry.milter().close(&mut self.session).await;
        self.session.end_stage();
    }

    /// Check ordering for `stage` and mark it running. Returns whether the
    /// registry has a handler for it.
    fn enter(&mut self, stage: Stage) -> Result<bool> {
        self.session.advance(stage)?;
        self.session.begin_stage(stage);
        Ok(self.registry.handles(stage))
    }

    fn respond(&mut self, stage: Stage, verdict: Verdict) -> Result<Outcome> {
        self.session.end_stage();
        let reply = self.session.take_reply();
        Ok(match self.verdict_reply(stage, verdict, reply)? {
            Some(reply) => Outcome::Replies(vec![reply]),
            None => Outcome::Silent,
        })
    }

    /// Queued modifications first, then the verdict
    fn finish_message(&mut self, verdict: Verdict) -> Result<Outcome> {
        self.session.end_stage();
        let reply = self.session.take_reply();
        let mut replies = self.session.take_modifications();
        let result = self.verdict_reply(Stage::EndOfMessage, verdict, reply);
        self.session.end_message();
        replies.extend(result?);
        Ok(Outcome::Replies(replies))
    }

    fn verdict_reply(
        &self,
        stage: Stage,
        verdict: Verdict,
        reply: Option<SmtpReply>,
    ) -> Result<Option<FilterReply>> {
        let steps = self.session.steps();
        let illegal = || Error::IllegalVerdict { stage, verdict };

        let no_reply = stage
            .no_reply_step()
            .is_some_and(|step| steps.contains(step));
        if no_reply {
            return match verdict {
                Verdict::Continue | Verdict::NoReply => Ok(None),
                _ => Err(illegal()),
            };
        }

        let reply = match verdict {
            Verdict::NoReply => return Err(illegal()),
            Verdict::Skip => {
                if stage != Stage::Body || !steps.contains(StepSet::SKIP) {
                    return Err(illegal());
                }
                FilterReply::Skip
            }
            Verdict::Continue => FilterReply::Continue,
            Verdict::Accept => FilterReply::Accept,
            Verdict::Discard => FilterReply::Discard,
            Verdict::Reject => match reply {
                Some(reply) if reply.code().is_permanent() => FilterReply::ReplyCode(reply.text()),
                _ => FilterReply::Reject,
            },
            Verdict::Tempfail => match reply {
                Some(reply) if reply.code().is_transient() => FilterReply::ReplyCode(reply.text()),
                _ => FilterReply::Tempfail,
            },
        };
        Ok(Some(reply))
    }
}
