//! Single-outstanding-command correlator.
//!
//! States are `Idle` (no slot) and `AwaitingResponse` (one slot). A slot is
//! only ever released by a response carrying its id, by its deadline passing,
//! or by an explicit clear.

use crate::protocol::Response;
use chrono::{DateTime, Utc};
use mtbridge_core::{BridgeError, CommandName, PendingCommand};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a waiting caller eventually receives.
pub type Reply = Result<Value, BridgeError>;

struct PendingSlot {
    id: String,
    command: CommandName,
    submitted_at: Instant,
    submitted_wall: DateTime<Utc>,
    timeout: Duration,
    reply: oneshot::Sender<Reply>,
}

impl PendingSlot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.submitted_at + self.timeout
    }

    fn snapshot(&self, now: Instant) -> PendingCommand {
        PendingCommand {
            id: self.id.clone(),
            command: self.command,
            submitted_at: self.submitted_wall,
            timeout_ms: duration_ms(self.timeout),
            expired: self.is_expired(now),
        }
    }

    fn settle(self, outcome: Reply) -> Settlement {
        Settlement {
            id: self.id,
            command: self.command,
            elapsed: self.submitted_at.elapsed(),
            reply: self.reply,
            outcome,
        }
    }

    fn settle_timeout(self) -> Settlement {
        let outcome = Err(BridgeError::Timeout {
            id: self.id.clone(),
            command: self.command,
            timeout_ms: duration_ms(self.timeout),
        });
        self.settle(outcome)
    }
}

/// A slot that has left the correlator but whose caller has not been told.
///
/// Callers finish any file cleanup first, then `deliver`.
#[derive(Debug)]
pub struct Settlement {
    pub id: String,
    pub command: CommandName,
    pub elapsed: Duration,
    reply: oneshot::Sender<Reply>,
    outcome: Reply,
}

impl Settlement {
    pub fn outcome(&self) -> &Reply {
        &self.outcome
    }

    /// Hand the outcome to the caller. `false` if nobody is waiting any more.
    pub fn deliver(self) -> bool {
        self.reply.send(self.outcome).is_ok()
    }
}

impl std::fmt::Debug for PendingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSlot")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of offering a response to the correlator.
#[derive(Debug)]
pub enum Resolution {
    /// The response answered the pending command; the slot is free.
    Matched(Settlement),
    /// The response belongs to some other command; the slot is untouched.
    Stale { id: String, pending: String },
    /// A response arrived while nothing was pending.
    Unsolicited { id: String },
}

#[derive(Debug, Default)]
pub struct Correlator {
    slot: Option<PendingSlot>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.slot.is_none()
    }

    pub fn pending_id(&self) -> Option<&str> {
        self.slot.as_ref().map(|slot| slot.id.as_str())
    }

    pub fn pending(&self, now: Instant) -> Option<PendingCommand> {
        self.slot.as_ref().map(|slot| slot.snapshot(now))
    }

    /// Occupy the slot with a new command.
    ///
    /// Fails with `Busy` while an unexpired command is outstanding. An expired
    /// occupant is evicted and returned as a timeout settlement.
    pub fn admit(
        &mut self,
        id: impl Into<String>,
        command: CommandName,
        timeout: Duration,
        reply: oneshot::Sender<Reply>,
        now: Instant,
    ) -> Result<Option<Settlement>, BridgeError> {
        if let Some(slot) = &self.slot {
            if !slot.is_expired(now) {
                return Err(BridgeError::Busy(format!(
                    "command {} ({}) is awaiting a response",
                    slot.command, slot.id
                )));
            }
        }

        let evicted = self.slot.take().map(PendingSlot::settle_timeout);
        self.slot = Some(PendingSlot {
            id: id.into(),
            command,
            submitted_at: now,
            submitted_wall: Utc::now(),
            timeout,
            reply,
        });
        Ok(evicted)
    }

    /// Match a response against the pending command by id.
    pub fn resolve(&mut self, response: Response) -> Resolution {
        match self.slot.take() {
            None => Resolution::Unsolicited { id: response.id },
            Some(slot) if slot.id != response.id => {
                let pending = slot.id.clone();
                self.slot = Some(slot);
                Resolution::Stale {
                    id: response.id,
                    pending,
                }
            }
            Some(slot) => Resolution::Matched(slot.settle(response.into_outcome())),
        }
    }

    /// Free the slot if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Settlement> {
        if self.slot.as_ref()?.is_expired(now) {
            self.slot.take().map(PendingSlot::settle_timeout)
        } else {
            None
        }
    }

    /// Time out a specific command regardless of its deadline.
    ///
    /// No-op when the slot holds a different command or nothing at all.
    pub fn expire_id(&mut self, id: &str) -> Option<Settlement> {
        self.take_if(id).map(PendingSlot::settle_timeout)
    }

    /// Free the slot of a command that never made it to disk.
    pub fn abandon(&mut self, id: &str, error: BridgeError) -> Option<Settlement> {
        self.take_if(id).map(|slot| slot.settle(Err(error)))
    }

    /// Drop whatever is pending; the waiter sees `Cleared`.
    pub fn clear(&mut self, now: Instant) -> Option<(PendingCommand, Settlement)> {
        let slot = self.slot.take()?;
        let snapshot = slot.snapshot(now);
        let outcome = Err(BridgeError::Cleared(slot.id.clone()));
        Some((snapshot, slot.settle(outcome)))
    }

    fn take_if(&mut self, id: &str) -> Option<PendingSlot> {
        if self.pending_id() == Some(id) {
            self.slot.take()
        } else {
            None
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIVE_SECS: Duration = Duration::from_secs(5);

    fn admit(
        correlator: &mut Correlator,
        id: &str,
        now: Instant,
    ) -> Result<oneshot::Receiver<Reply>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        correlator.admit(id, CommandName::GetBalance, FIVE_SECS, tx, now)?;
        Ok(rx)
    }

    #[test]
    fn test_second_admission_is_busy() {
        let mut correlator = Correlator::new();
        let t0 = Instant::now();

        admit(&mut correlator, "a1", t0).unwrap();
        match admit(&mut correlator, "b1", t0 + Duration::from_secs(1)) {
            Err(BridgeError::Busy(msg)) => assert!(msg.contains("a1")),
            other => panic!("Expected busy, got {:?}", other.map(|_| ())),
        }
        assert_eq!(correlator.pending_id(), Some("a1"));
    }

    #[test]
    fn test_mismatched_id_keeps_slot() {
        let mut correlator = Correlator::new();
        let mut rx = admit(&mut correlator, "a1", Instant::now()).unwrap();

        match correlator.resolve(Response::success("zz", json!(1))) {
            Resolution::Stale { id, pending } => {
                assert_eq!(id, "zz");
                assert_eq!(pending, "a1");
            }
            other => panic!("Expected stale, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        match correlator.resolve(Response::success("a1", json!(10532.40))) {
            Resolution::Matched(settlement) => assert!(settlement.deliver()),
            other => panic!("Expected match, got {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(10532.40));
        assert!(correlator.is_idle());
    }

    #[test]
    fn test_rejection_passes_message_through() {
        let mut correlator = Correlator::new();
        let mut rx = admit(&mut correlator, "a1", Instant::now()).unwrap();

        if let Resolution::Matched(settlement) =
            correlator.resolve(Response::failure("a1", "Invalid ticket"))
        {
            settlement.deliver();
        }
        match rx.try_recv().unwrap() {
            Err(BridgeError::Rejected(msg)) => assert_eq!(msg, "Invalid ticket"),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_expiry_frees_slot() {
        let mut correlator = Correlator::new();
        let t0 = Instant::now();
        let mut rx = admit(&mut correlator, "a1", t0).unwrap();

        assert!(correlator.expire(t0 + Duration::from_secs(4)).is_none());
        let settlement = correlator.expire(t0 + FIVE_SECS).unwrap();
        assert_eq!(settlement.id, "a1");
        settlement.deliver();

        match rx.try_recv().unwrap() {
            Err(BridgeError::Timeout { id, timeout_ms, .. }) => {
                assert_eq!(id, "a1");
                assert_eq!(timeout_ms, 5_000);
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(admit(&mut correlator, "b1", t0 + FIVE_SECS).is_ok());
    }

    #[test]
    fn test_admission_evicts_expired_occupant() {
        let mut correlator = Correlator::new();
        let t0 = Instant::now();
        admit(&mut correlator, "a1", t0).unwrap();

        let (tx, _rx) = oneshot::channel();
        let evicted = correlator
            .admit("b1", CommandName::Ping, FIVE_SECS, tx, t0 + Duration::from_secs(6))
            .unwrap()
            .unwrap();
        assert_eq!(evicted.id, "a1");
        assert!(matches!(evicted.outcome(), Err(BridgeError::Timeout { .. })));
        assert_eq!(correlator.pending_id(), Some("b1"));
    }

    #[test]
    fn test_late_response_after_timeout_is_unsolicited() {
        let mut correlator = Correlator::new();
        let t0 = Instant::now();
        admit(&mut correlator, "a1", t0).unwrap();
        correlator.expire(t0 + FIVE_SECS).unwrap();

        assert!(matches!(
            correlator.resolve(Response::success("a1", json!("late"))),
            Resolution::Unsolicited { .. }
        ));
    }

    #[test]
    fn test_expire_id_ignores_other_commands() {
        let mut correlator = Correlator::new();
        admit(&mut correlator, "a1", Instant::now()).unwrap();

        assert!(correlator.expire_id("b1").is_none());
        assert!(correlator.abandon("b1", BridgeError::Stopped).is_none());
        assert!(correlator.expire_id("a1").is_some());
        assert!(correlator.is_idle());
    }

    #[test]
    fn test_clear_reports_snapshot() {
        let mut correlator = Correlator::new();
        let t0 = Instant::now();
        let mut rx = admit(&mut correlator, "a1", t0).unwrap();

        let (snapshot, settlement) = correlator.clear(t0).unwrap();
        settlement.deliver();
        assert_eq!(snapshot.id, "a1");
        assert_eq!(snapshot.command, CommandName::GetBalance);
        assert!(!snapshot.expired);
        assert!(matches!(rx.try_recv().unwrap(), Err(BridgeError::Cleared(_))));
        assert!(correlator.clear(t0).is_none());
    }
}
