//! The application-facing extension point.
//!
//! The engine never interprets values. It hands each decided value to a
//! [`Recovery`] implementation exactly once, in SCN order, and persists its
//! own acceptor promises through an [`AcceptorLog`]. Both traits are usually
//! implemented by the same type (see [`RecoveryBase`]).

use std::collections::BTreeMap;

use paxlog_types::{Ballot, Scn, Value};
use serde::{Deserialize, Serialize};

/// Errors surfaced by a recovery implementation.
///
/// Any error from [`Recovery::apply_decided`] is fatal to the engine: a
/// half-applied value cannot be retried safely from inside consensus.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `apply_decided` was called for a SCN that does not immediately follow
    /// the last applied one.
    #[error("out-of-order apply: expected scn {expected}, got {got}")]
    OutOfOrder { expected: Scn, got: Scn },
}

/// Durable acceptor state for one SCN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AcceptorSlot {
    /// Highest ballot promised for this SCN.
    pub promised: Ballot,
    /// Last value accepted, with the ballot it was accepted at.
    pub accepted: Option<(Ballot, Value)>,
}

/// Consumer of decided values.
pub trait Recovery {
    /// Applies the value decided for `scn`.
    ///
    /// Called exactly once per SCN, in strictly increasing order starting
    /// at `last_applied_scn().next()`. Must be durable before returning.
    fn apply_decided(&mut self, scn: Scn, value: &Value) -> Result<(), RecoveryError>;

    /// Highest SCN applied so far, `Scn::ZERO` if none.
    fn last_applied_scn(&self) -> Scn;

    /// Moves the apply position to `scn`, forwards or backwards.
    ///
    /// Afterwards `last_applied_scn()` returns `scn` and the next
    /// `apply_decided` is for `scn.next()`. Applied values above `scn` are
    /// forgotten. Must be durable before returning.
    fn set_scn(&mut self, scn: Scn) -> Result<(), RecoveryError>;

    /// Returns the value applied at `scn`, if still retained.
    ///
    /// Used to answer peers that are behind. Returning `None` is always
    /// safe; the lagging peer then waits for someone else to answer.
    fn decided_value(&self, scn: Scn) -> Option<Value>;
}

/// Durable storage for acceptor promises and accepted values.
///
/// A slot must be durable before the acceptor replies to the message that
/// changed it.
pub trait AcceptorLog {
    fn load_slot(&self, scn: Scn) -> Result<Option<AcceptorSlot>, RecoveryError>;

    fn store_slot(&mut self, scn: Scn, slot: &AcceptorSlot) -> Result<(), RecoveryError>;

    /// Drops every slot at or below `scn`. Only called with applied SCNs.
    fn prune_through(&mut self, scn: Scn) -> Result<(), RecoveryError>;
}

/// Everything the follower needs from the application.
pub trait RecoveryBase: Recovery + AcceptorLog + Send {}

impl<T: Recovery + AcceptorLog + Send> RecoveryBase for T {}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Non-durable [`RecoveryBase`] for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecovery {
    applied: BTreeMap<Scn, Value>,
    last_applied: Scn,
    slots: BTreeMap<Scn, AcceptorSlot>,
    fail_apply_at: Option<Scn>,
}

impl MemoryRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts as if everything through `scn` had already been applied.
    pub fn starting_at(scn: Scn) -> Self {
        Self {
            last_applied: scn,
            ..Self::default()
        }
    }

    /// Makes `apply_decided` fail when it reaches `scn`.
    pub fn fail_apply_at(mut self, scn: Scn) -> Self {
        self.fail_apply_at = Some(scn);
        self
    }

    /// Values applied so far, in SCN order.
    pub fn applied(&self) -> impl Iterator<Item = (Scn, &Value)> {
        self.applied.iter().map(|(scn, v)| (*scn, v))
    }

    /// Number of acceptor slots still held.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl Recovery for MemoryRecovery {
    fn apply_decided(&mut self, scn: Scn, value: &Value) -> Result<(), RecoveryError> {
        let expected = self.last_applied.next();
        if scn != expected {
            return Err(RecoveryError::OutOfOrder {
                expected,
                got: scn,
            });
        }
        if self.fail_apply_at == Some(scn) {
            return Err(RecoveryError::Storage(format!(
                "injected apply failure at scn {scn}"
            )));
        }
        self.applied.insert(scn, value.clone());
        self.last_applied = scn;
        Ok(())
    }

    fn last_applied_scn(&self) -> Scn {
        self.last_applied
    }

    fn set_scn(&mut self, scn: Scn) -> Result<(), RecoveryError> {
        self.applied.retain(|s, _| *s <= scn);
        self.last_applied = scn;
        Ok(())
    }

    fn decided_value(&self, scn: Scn) -> Option<Value> {
        self.applied.get(&scn).cloned()
    }
}

impl AcceptorLog for MemoryRecovery {
    fn load_slot(&self, scn: Scn) -> Result<Option<AcceptorSlot>, RecoveryError> {
        Ok(self.slots.get(&scn).cloned())
    }

    fn store_slot(&mut self, scn: Scn, slot: &AcceptorSlot) -> Result<(), RecoveryError> {
        self.slots.insert(scn, slot.clone());
        Ok(())
    }

    fn prune_through(&mut self, scn: Scn) -> Result<(), RecoveryError> {
        self.slots.retain(|s, _| *s > scn);
        Ok(())
    }
}
