//! Agent-side harness shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bstr::BStr;
use futures::{SinkExt, StreamExt};
use milter_engine::capabilities::ActionSet;
use milter_engine::proto::{AgentMessage, FilterReply, OptionNegotiation, PacketCodec};
use milter_engine::{
    Milter, NegotiationOutcome, Offer, PeerAddr, Registry, Session, SmtpReply, Verdict,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Plays the mail agent over any stream
pub struct Agent<S> {
    framed: Framed<S, PacketCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Agent<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec::new(1_048_575)),
        }
    }

    pub async fn send(&mut self, message: AgentMessage) {
        self.framed.send(message.to_packet()).await.unwrap();
    }

    /// Next reply, `None` once the filter closed the connection
    pub async fn recv(&mut self) -> Option<FilterReply> {
        let packet = timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("filter did not answer")?;
        packet.ok().map(|p| FilterReply::decode(&p).unwrap())
    }

    pub async fn expect(&mut self, message: AgentMessage, reply: FilterReply) {
        self.send(message).await;
        assert_eq!(self.recv().await, Some(reply));
    }

    pub async fn negotiate(&mut self, actions: u32, steps: u32) -> FilterReply {
        self.send(AgentMessage::Negotiate(OptionNegotiation {
            version: 6,
            actions,
            steps,
        }))
        .await;
        self.recv().await.expect("no negotiation reply")
    }

    /// Connect, mail and one recipient, each answered with continue
    pub async fn open_transaction(&mut self, client: &str) {
        self.send(AgentMessage::Macros {
            stage: b'C',
            pairs: vec![("{client_name}".into(), client.into())],
        })
        .await;
        self.expect(
            AgentMessage::Connect {
                hostname: client.into(),
                address: PeerAddr::V4("192.0.2.1".parse().unwrap(), 25),
            },
            FilterReply::Continue,
        )
        .await;
        self.expect(
            AgentMessage::Mail {
                address: "<sender@example.com>".into(),
                args: vec![],
            },
            FilterReply::Continue,
        )
        .await;
        self.expect(
            AgentMessage::Recipient {
                address: "<rcpt@example.com>".into(),
                args: vec![],
            },
            FilterReply::Continue,
        )
        .await;
    }
}

/// Counts drops of the context it is stored in
pub struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Transaction {
    pub client: String,
    pub body_bytes: usize,
    _guard: DropGuard,
}

/// Filter used by the integration tests
#[derive(Default)]
pub struct TestFilter {
    pub closes: AtomicUsize,
    pub drops: Arc<AtomicUsize>,
    pub errors: Mutex<Vec<String>>,
    pub accept_all: bool,
    pub progress_at_eom: bool,
    pub oversized_reply: bool,
    pub slow_eom: Option<Duration>,
}

impl TestFilter {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl Milter for TestFilter {
    type Context = Transaction;

    async fn negotiate(
        &self,
        _session: &mut Session<Transaction>,
        offer: &Offer,
    ) -> Option<NegotiationOutcome> {
        self.accept_all.then(|| NegotiationOutcome::accept_all(offer))
    }

    async fn connect(
        &self,
        session: &mut Session<Transaction>,
        hostname: &BStr,
        _address: &PeerAddr,
    ) -> Verdict {
        let client = session
            .symbol("client_name")
            .unwrap_or(hostname)
            .to_string();
        session.set_context(Transaction {
            client,
            body_bytes: 0,
            _guard: DropGuard(Arc::clone(&self.drops)),
        });
        Verdict::Continue
    }

    async fn body(&self, session: &mut Session<Transaction>, chunk: &[u8]) -> Verdict {
        if let Some(tx) = session.context_mut() {
            tx.body_bytes += chunk.len();
        }
        Verdict::Continue
    }

    async fn end_of_message(&self, session: &mut Session<Transaction>) -> Verdict {
        if self.progress_at_eom {
            session.progress().unwrap();
        }
        if let Some(delay) = self.slow_eom {
            tokio::time::sleep(delay).await;
        }

        if self.oversized_reply {
            let lines: Vec<String> = (0..33).map(|i| format!("line {i}")).collect();
            match SmtpReply::multi_line("451", Some("4.3.0"), &lines) {
                Ok(reply) => session.set_reply(reply),
                Err(e) => {
                    self.errors.lock().unwrap().push(e.to_string());
                    return Verdict::Tempfail;
                }
            }
        }

        let summary = session
            .context()
            .map(|tx| format!("{} {}", tx.client, tx.body_bytes))
            .unwrap_or_default();
        if let Err(e) = session.add_header("X-Test-Client", &summary) {
            self.errors.lock().unwrap().push(e.to_string());
        }
        Verdict::Accept
    }

    async fn close(&self, _session: &mut Session<Transaction>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn registry(filter: TestFilter) -> Arc<Registry<TestFilter>> {
    Arc::new(Registry::new("test", filter).with_actions(ActionSet::ADD_HEADER))
}
