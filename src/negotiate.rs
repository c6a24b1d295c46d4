//! Option negotiation: reconcile what the agent offers with what the filter
//! asks for.

use tracing::debug;

use crate::capabilities::{ActionSet, StepSet};
use crate::macros::MacroStage;
use crate::milter::Verdict;
use crate::proto::{FilterReply, OptionNegotiation};
use crate::{Error, Result};

/// Highest protocol version this engine speaks
pub const PROTOCOL_VERSION: u32 = 6;

/// Oldest agent protocol version accepted
pub const MIN_AGENT_VERSION: u32 = 2;

/// What the agent offered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub version: u32,
    pub actions: ActionSet,
    pub steps: StepSet,
}

impl Offer {
    pub fn from_wire(raw: OptionNegotiation) -> Result<Self> {
        if raw.version < MIN_AGENT_VERSION {
            return Err(Error::Negotiation(format!(
                "agent protocol version {} is older than {}",
                raw.version, MIN_AGENT_VERSION
            )));
        }
        Ok(Self {
            version: raw.version,
            actions: ActionSet::from_mask(raw.actions),
            steps: StepSet::from_mask(raw.steps),
        })
    }
}

/// Macros the filter wants for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolList {
    pub stage: MacroStage,
    pub macros: Vec<String>,
}

/// Answer of a negotiation handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub verdict: Verdict,
    pub actions: ActionSet,
    pub steps: StepSet,
    pub symbol_lists: Vec<SymbolList>,
}

impl NegotiationOutcome {
    pub fn new(actions: ActionSet, steps: StepSet) -> Self {
        Self {
            verdict: Verdict::Continue,
            actions,
            steps,
            symbol_lists: Vec::new(),
        }
    }

    /// Take everything the agent offered
    pub fn accept_all(offer: &Offer) -> Self {
        Self::new(offer.actions, offer.steps)
    }

    /// Turn the session down
    pub fn decline(verdict: Verdict) -> Self {
        Self {
            verdict,
            ..Self::new(ActionSet::empty(), StepSet::empty())
        }
    }

    pub fn with_symbol_list<I, S>(mut self, stage: MacroStage, macros: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbol_lists.push(SymbolList {
            stage,
            macros: macros.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Parameters in force for the rest of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u32,
    pub actions: ActionSet,
    pub steps: StepSet,
}

impl Negotiated {
    pub fn max_chunk_size(&self) -> usize {
        self.steps.max_chunk_size()
    }
}

/// Settle the negotiation and build the reply packet.
///
/// Without a handler outcome the filter takes the offered actions it was
/// configured for and the `default_steps` the agent offered. Nothing is
/// sent if this fails.
pub fn negotiate(
    offer: &Offer,
    outcome: Option<NegotiationOutcome>,
    configured: ActionSet,
    default_steps: StepSet,
) -> Result<(Negotiated, FilterReply)> {
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => NegotiationOutcome::new(
            offer.actions & configured,
            offer.steps & default_steps,
        ),
    };

    if outcome.verdict != Verdict::Continue {
        return Err(Error::Negotiation(format!(
            "filter declined the connection ({})",
            outcome.verdict
        )));
    }

    let extra_actions = outcome.actions - offer.actions;
    if !extra_actions.is_empty() {
        return Err(Error::Negotiation(format!(
            "filter requested actions the agent did not offer: {:?}",
            extra_actions
        )));
    }

    let extra_steps = outcome.steps - offer.steps;
    if !extra_steps.is_empty() {
        return Err(Error::Negotiation(format!(
            "filter requested protocol steps the agent did not offer: {:?}",
            extra_steps
        )));
    }

    if !outcome.symbol_lists.is_empty() && !outcome.actions.contains(ActionSet::SET_SYMBOL_LIST) {
        return Err(Error::Negotiation(
            "symbol lists require the set symbol list action".into(),
        ));
    }

    let negotiated = Negotiated {
        version: offer.version.min(PROTOCOL_VERSION),
        actions: outcome.actions,
        steps: outcome.steps,
    };
    debug!(
        "Negotiated version {} actions {:?} steps {:?}",
        negotiated.version, negotiated.actions, negotiated.steps
    );

    let reply = FilterReply::Negotiate {
        version: negotiated.version,
        actions: negotiated.actions.bits(),
        steps: negotiated.steps.bits(),
        symbol_lists: outcome
            .symbol_lists
            .into_iter()
            .map(|list| (list.stage.code(), list.macros.join(" ")))
            .collect(),
    };

    Ok((negotiated, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Offer {
        Offer::from_wire(OptionNegotiation {
            version: 6,
            actions: 0x1ff,
            steps: 0x001f_ffff,
        })
        .unwrap()
    }

    #[test]
    fn test_old_agent_refused() {
        let raw = OptionNegotiation {
            version: 1,
            actions: 0,
            steps: 0,
        };
        assert!(matches!(Offer::from_wire(raw), Err(Error::Negotiation(_))));
    }

    #[test]
    fn test_default_intersects_configured_actions() {
        let offer = Offer::from_wire(OptionNegotiation {
            version: 2,
            actions: 0x01 | 0x10,
            steps: 0x7f,
        })
        .unwrap();
        let configured = ActionSet::ADD_HEADER | ActionSet::QUARANTINE;
        let (negotiated, reply) =
            negotiate(&offer, None, configured, StepSet::empty()).unwrap();

        assert_eq!(negotiated.version, 2);
        assert_eq!(negotiated.actions, ActionSet::ADD_HEADER);
        assert!(negotiated.steps.is_empty());
        assert_eq!(
            reply,
            FilterReply::Negotiate {
                version: 2,
                actions: 0x01,
                steps: 0,
                symbol_lists: vec![],
            }
        );
    }

    #[test]
    fn test_default_steps_limited_to_offer() {
        let offer = Offer::from_wire(OptionNegotiation {
            version: 6,
            actions: 0,
            steps: 0x1,
        })
        .unwrap();
        let wanted = StepSet::NO_CONNECT | StepSet::NO_HELO;
        let (negotiated, _) = negotiate(&offer, None, ActionSet::empty(), wanted).unwrap();
        assert_eq!(negotiated.steps, StepSet::NO_CONNECT);
    }

    #[test]
    fn test_unoffered_bits_rejected() {
        let offer = Offer::from_wire(OptionNegotiation {
            version: 6,
            actions: 0x01,
            steps: 0,
        })
        .unwrap();
        let outcome = NegotiationOutcome::new(ActionSet::CHANGE_BODY, StepSet::empty());
        assert!(matches!(
            negotiate(&offer, Some(outcome), ActionSet::all(), StepSet::empty()),
            Err(Error::Negotiation(_))
        ));

        let outcome = NegotiationOutcome::new(ActionSet::empty(), StepSet::SKIP);
        assert!(negotiate(&offer, Some(outcome), ActionSet::all(), StepSet::empty()).is_err());
    }

    #[test]
    fn test_accept_all_and_version_cap() {
        let mut offer = offer();
        offer.version = 8;
        let (negotiated, _) = negotiate(
            &offer,
            Some(NegotiationOutcome::accept_all(&offer)),
            ActionSet::empty(),
            StepSet::empty(),
        )
        .unwrap();
        assert_eq!(negotiated.version, PROTOCOL_VERSION);
        assert_eq!(negotiated.actions, offer.actions);
        assert_eq!(negotiated.steps, offer.steps);
        assert!(offer.actions.contains(negotiated.actions));
    }

    #[test]
    fn test_declined() {
        assert!(matches!(
            negotiate(
                &offer(),
                Some(NegotiationOutcome::decline(Verdict::Reject)),
                ActionSet::all(),
                StepSet::empty()
            ),
            Err(Error::Negotiation(_))
        ));
    }

    #[test]
    fn test_symbol_lists() {
        let offer = offer();
        let outcome = NegotiationOutcome::new(ActionSet::SET_SYMBOL_LIST, StepSet::empty())
        .with_symbol_list(MacroStage::Connect, ["{client_addr}", "j"])
        .with_symbol_list(MacroStage::Mail, ["i"]);
        let (_, reply) = negotiate(&offer, Some(outcome), ActionSet::empty(), StepSet::empty())
            .unwrap();
        match reply {
            FilterReply::Negotiate { symbol_lists, .. } => assert_eq!(
                symbol_lists,
                vec![(0, "{client_addr} j".to_string()), (2, "i".to_string())]
            ),
            other => panic!("unexpected: {:?}", other),
        }

        let without_action = NegotiationOutcome::new(ActionSet::empty(), StepSet::empty())
            .with_symbol_list(MacroStage::Helo, ["{tls_version}"]);
        assert!(
            negotiate(&offer, Some(without_action), ActionSet::all(), StepSet::empty()).is_err()
        );
    }
}
