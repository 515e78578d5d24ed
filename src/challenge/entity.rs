//! Challenge records and their status machine
//!
//! ```text
//! Accepted ──► Committed
//!    │  ▲
//!    │  └─ retry (bounded) ─┐
//!    ├──► Error ────────────┘
//!    │      └──► Failed
//!    └──► Failed
//! ```
//!
//! Committed and Failed are terminal.

use serde::{Deserialize, Serialize};

use super::ticket::ValidationTicket;
use crate::datastore::Entity;
use crate::digest;
use crate::error::StorageError;

pub const CHALLENGE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Accepted,
    Committed,
    Failed,
    Error,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        matches!(
            (self, next),
            (Accepted, Committed) | (Accepted, Failed) | (Accepted, Error) | (Error, Accepted) | (Error, Failed)
        )
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Validator candidate for a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationNode {
    pub id: String,
    pub url: String,
}

/// The challenged blobber
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: String,
    pub url: String,
}

/// Authenticated ticket counts; what they mean is the caller's policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketTally {
    pub success: usize,
    pub failure: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeEntity {
    pub version: String,
    #[serde(rename = "created")]
    pub creation_date: i64,
    pub id: String,
    pub validators: Vec<ValidationNode>,
    #[serde(rename = "seed")]
    pub random_number: i64,
    pub allocation_id: String,
    pub blobber: StorageNode,
    /// Root hash the blobber committed to when accepting
    #[serde(default)]
    pub allocation_root: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub commit_txn_id: String,
    #[serde(default)]
    pub block_num: i64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub write_marker: String,
    #[serde(default)]
    pub validation_tickets: Vec<ValidationTicket>,
}

impl Entity for ChallengeEntity {
    const NAME: &'static str = "challenge";

    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

impl ChallengeEntity {
    pub fn new(
        id: &str,
        allocation_id: &str,
        blobber: StorageNode,
        validators: Vec<ValidationNode>,
        random_number: i64,
    ) -> Self {
        Self {
            version: CHALLENGE_VERSION.to_string(),
            creation_date: digest::now(),
            id: id.to_string(),
            validators,
            random_number,
            allocation_id: allocation_id.to_string(),
            blobber,
            allocation_root: String::new(),
            status: ChallengeStatus::Accepted,
            status_message: String::new(),
            commit_txn_id: String::new(),
            block_num: 0,
            retries: 0,
            write_marker: String::new(),
            validation_tickets: Vec::new(),
        }
    }

    fn transition(&mut self, next: ChallengeStatus) -> Result<(), StorageError> {
        if !self.status.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_committed(&mut self, commit_txn_id: &str, block_num: i64) -> Result<(), StorageError> {
        self.transition(ChallengeStatus::Committed)?;
        self.commit_txn_id = commit_txn_id.to_string();
        self.block_num = block_num;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: &str) -> Result<(), StorageError> {
        self.transition(ChallengeStatus::Failed)?;
        self.status_message = message.to_string();
        Ok(())
    }

    pub fn mark_error(&mut self, message: &str) -> Result<(), StorageError> {
        self.transition(ChallengeStatus::Error)?;
        self.status_message = message.to_string();
        Ok(())
    }

    /// Move an errored challenge back to Accepted, at most `max_retries` times
    pub fn retry(&mut self, max_retries: u32) -> Result<(), StorageError> {
        if self.status == ChallengeStatus::Error && self.retries >= max_retries {
            return Err(StorageError::RetriesExhausted {
                id: self.id.clone(),
                retries: self.retries,
            });
        }
        self.transition(ChallengeStatus::Accepted)?;
        self.retries += 1;
        Ok(())
    }

    /// Authenticate a validator ticket and record it
    ///
    /// Rejected: a challenge that is not Accepted, a ticket for another
    /// challenge or blobber, a validator that is not a candidate, a second
    /// ticket from the same validator, and any signature that does not verify.
    pub fn add_validation_ticket(&mut self, ticket: ValidationTicket) -> Result<(), StorageError> {
        if self.status != ChallengeStatus::Accepted {
            return Err(StorageError::InvalidTicket(format!(
                "challenge {} is {}",
                self.id, self.status
            )));
        }
        if ticket.challenge_id != self.id {
            return Err(StorageError::InvalidTicket(format!(
                "ticket is for challenge {}",
                ticket.challenge_id
            )));
        }
        if ticket.blobber_id != self.blobber.id {
            return Err(StorageError::InvalidTicket(format!(
                "ticket is for blobber {}",
                ticket.blobber_id
            )));
        }
        if !self.validators.iter().any(|v| v.id == ticket.validator_id) {
            return Err(StorageError::InvalidTicket(format!(
                "{} is not a validator for this challenge",
                ticket.validator_id
            )));
        }
        if self
            .validation_tickets
            .iter()
            .any(|t| t.validator_id == ticket.validator_id)
        {
            return Err(StorageError::InvalidTicket(format!(
                "duplicate ticket from {}",
                ticket.validator_id
            )));
        }
        if !ticket.verify_sign()? {
            return Err(StorageError::InvalidTicket(format!(
                "signature from {} does not verify",
                ticket.validator_id
            )));
        }

        self.validation_tickets.push(ticket);
        Ok(())
    }

    /// Count recorded tickets by result
    pub fn tally(&self) -> TicketTally {
        let success = self.validation_tickets.iter().filter(|t| t.result).count();
        TicketTally {
            success,
            failure: self.validation_tickets.len() - success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn challenge() -> ChallengeEntity {
        ChallengeEntity::new(
            "ch1",
            "A1",
            StorageNode {
                id: "b1".into(),
                url: "http://b1".into(),
            },
            (1..=3)
                .map(|i| ValidationNode {
                    id: format!("v{}", i),
                    url: format!("http://v{}", i),
                })
                .collect(),
            42,
        )
    }

    fn ticket(validator: u8, result: bool) -> ValidationTicket {
        let mut ticket = ValidationTicket {
            challenge_id: "ch1".into(),
            blobber_id: "b1".into(),
            validator_id: format!("v{}", validator),
            validator_key: String::new(),
            result,
            message: String::new(),
            message_code: String::new(),
            timestamp: 1_700_000_000,
            signature: String::new(),
        };
        ticket.sign(&SigningKey::from_bytes(&[validator; 32]));
        ticket
    }

    #[test]
    fn test_terminal_states_are_final() {
        let all = [
            ChallengeStatus::Accepted,
            ChallengeStatus::Committed,
            ChallengeStatus::Failed,
            ChallengeStatus::Error,
        ];
        for terminal in [ChallengeStatus::Committed, ChallengeStatus::Failed] {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }

        let mut ch = challenge();
        ch.mark_committed("txn1", 10).unwrap();
        assert!(ch.mark_failed("late").is_err());
        assert!(ch.mark_error("late").is_err());
        assert!(ch.retry(5).is_err());
        assert_eq!(ch.status, ChallengeStatus::Committed);
        assert_eq!(ch.commit_txn_id, "txn1");
    }

    #[test]
    fn test_error_retry_is_bounded() {
        let mut ch = challenge();
        for _ in 0..2 {
            ch.mark_error("submit failed").unwrap();
            ch.retry(2).unwrap();
        }
        ch.mark_error("submit failed").unwrap();
        assert!(matches!(
            ch.retry(2),
            Err(StorageError::RetriesExhausted { retries: 2, .. })
        ));
        ch.mark_failed("gave up").unwrap();
        assert!(ch.status.is_terminal());
    }

    #[test]
    fn test_retry_requires_error_state() {
        let mut ch = challenge();
        assert!(matches!(ch.retry(3), Err(StorageError::InvalidTransition { .. })));
    }

    #[test]
    fn test_ticket_collection_and_tally() {
        let mut ch = challenge();
        ch.add_validation_ticket(ticket(1, true)).unwrap();
        ch.add_validation_ticket(ticket(2, false)).unwrap();
        assert_eq!(ch.tally(), TicketTally { success: 1, failure: 1 });
    }

    #[test]
    fn test_forged_tickets_are_never_counted() {
        let mut ch = challenge();

        let mut forged = ticket(1, false);
        forged.result = true;
        assert!(matches!(
            ch.add_validation_ticket(forged),
            Err(StorageError::InvalidTicket(_))
        ));

        let mut wrong_blobber = ticket(1, true);
        wrong_blobber.blobber_id = "b2".into();
        assert!(ch.add_validation_ticket(wrong_blobber).is_err());

        assert!(ch.add_validation_ticket(ticket(9, true)).is_err());

        ch.add_validation_ticket(ticket(1, true)).unwrap();
        assert!(ch.add_validation_ticket(ticket(1, true)).is_err());

        assert_eq!(ch.tally(), TicketTally { success: 1, failure: 0 });
    }

    #[test]
    fn test_no_tickets_after_terminal() {
        let mut ch = challenge();
        ch.mark_failed("timeout").unwrap();
        assert!(ch.add_validation_ticket(ticket(1, true)).is_err());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(challenge()).unwrap();
        assert_eq!(json["seed"], 42);
        assert_eq!(json["status"], "accepted");
        assert!(json.get("created").is_some());
    }
}
