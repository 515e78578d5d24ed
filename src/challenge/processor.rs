//! Challenge processing against the reference tree

use std::sync::Arc;

use tracing::{info, warn};

use super::entity::{ChallengeEntity, ChallengeStatus};
use super::ticket::ValidationTicket;
use crate::datastore::{EntityRegistry, StoreContext};
use crate::error::StorageError;
use crate::reference::ReferenceStore;

/// Result of submitting a batch of tickets
#[derive(Debug, Default)]
pub struct TicketOutcome {
    /// Validator ids whose tickets were recorded
    pub accepted: Vec<String>,
    /// Validator id and reason for every rejected ticket
    pub rejected: Vec<(String, StorageError)>,
}

pub struct ChallengeProcessor {
    registry: Arc<EntityRegistry>,
    ref_store: Arc<ReferenceStore>,
    max_retries: u32,
}

impl ChallengeProcessor {
    pub fn new(registry: Arc<EntityRegistry>, ref_store: Arc<ReferenceStore>, max_retries: u32) -> Self {
        Self {
            registry,
            ref_store,
            max_retries,
        }
    }

    /// Authenticate one ticket
    pub fn verify_signature(&self, ticket: &ValidationTicket) -> Result<bool, StorageError> {
        ticket.verify_sign()
    }

    pub fn get(&self, ctx: &StoreContext, challenge_id: &str) -> Result<ChallengeEntity, StorageError> {
        self.registry.read(ctx, challenge_id)
    }

    fn save(&self, ctx: &StoreContext, challenge: &ChallengeEntity) -> Result<(), StorageError> {
        self.registry.write(ctx, challenge)
    }

    /// Accept a newly issued challenge, committing to the current root hash
    ///
    /// A challenge that is already stored is returned unchanged.
    pub fn accept(
        &self,
        ctx: &StoreContext,
        mut challenge: ChallengeEntity,
    ) -> Result<ChallengeEntity, StorageError> {
        match self.get(ctx, &challenge.id) {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let root = self
            .ref_store
            .get_root(ctx, &challenge.allocation_id)
            .map_err(|e| e.context(format!("reading root for challenge {}", challenge.id)))?;

        if !challenge.allocation_root.is_empty() && challenge.allocation_root != root.hash {
            warn!(
                challenge_id = %challenge.id,
                issued_root = %challenge.allocation_root,
                local_root = %root.hash,
                "Challenge issued against a different allocation root"
            );
        }
        challenge.allocation_root = root.hash;
        challenge.status = ChallengeStatus::Accepted;
        self.save(ctx, &challenge)?;

        info!(
            challenge_id = %challenge.id,
            allocation_id = %challenge.allocation_id,
            allocation_root = %challenge.allocation_root,
            "Accepted challenge"
        );
        Ok(challenge)
    }

    /// Record every ticket that authenticates; report the rest
    pub fn add_tickets(
        &self,
        ctx: &StoreContext,
        challenge_id: &str,
        tickets: Vec<ValidationTicket>,
    ) -> Result<TicketOutcome, StorageError> {
        let mut challenge = self.get(ctx, challenge_id)?;
        let mut outcome = TicketOutcome::default();

        for ticket in tickets {
            let validator_id = ticket.validator_id.clone();
            match challenge.add_validation_ticket(ticket) {
                Ok(()) => outcome.accepted.push(validator_id),
                Err(e) => {
                    warn!(
                        challenge_id = %challenge_id,
                        validator_id = %validator_id,
                        error = %e,
                        "Rejected validation ticket"
                    );
                    outcome.rejected.push((validator_id, e));
                }
            }
        }

        self.save(ctx, &challenge)?;
        Ok(outcome)
    }

    pub fn mark_committed(
        &self,
        ctx: &StoreContext,
        challenge_id: &str,
        commit_txn_id: &str,
        block_num: i64,
    ) -> Result<ChallengeEntity, StorageError> {
        let mut challenge = self.get(ctx, challenge_id)?;
        challenge.mark_committed(commit_txn_id, block_num)?;
        self.save(ctx, &challenge)?;
        info!(challenge_id = %challenge_id, txn = %commit_txn_id, "Challenge committed");
        Ok(challenge)
    }

    pub fn mark_failed(
        &self,
        ctx: &StoreContext,
        challenge_id: &str,
        message: &str,
    ) -> Result<ChallengeEntity, StorageError> {
        let mut challenge = self.get(ctx, challenge_id)?;
        challenge.mark_failed(message)?;
        self.save(ctx, &challenge)?;
        info!(challenge_id = %challenge_id, message = %message, "Challenge failed");
        Ok(challenge)
    }

    pub fn mark_error(
        &self,
        ctx: &StoreContext,
        challenge_id: &str,
        message: &str,
    ) -> Result<ChallengeEntity, StorageError> {
        let mut challenge = self.get(ctx, challenge_id)?;
        challenge.mark_error(message)?;
        self.save(ctx, &challenge)?;
        warn!(challenge_id = %challenge_id, message = %message, "Challenge errored");
        Ok(challenge)
    }

    /// Return an errored challenge to Accepted within the retry bound
    pub fn retry(&self, ctx: &StoreContext, challenge_id: &str) -> Result<ChallengeEntity, StorageError> {
        let mut challenge = self.get(ctx, challenge_id)?;
        challenge.retry(self.max_retries)?;
        self.save(ctx, &challenge)?;
        info!(challenge_id = %challenge_id, retries = challenge.retries, "Retrying challenge");
        Ok(challenge)
    }

    /// Challenges still awaiting a terminal status
    pub fn list_open(&self, ctx: &StoreContext) -> Result<Vec<ChallengeEntity>, StorageError> {
        Ok(self
            .registry
            .list::<ChallengeEntity>(ctx)?
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::entity::{StorageNode, ValidationNode};
    use crate::datastore::SledStore;
    use crate::reference::Ref;
    use ed25519_dalek::SigningKey;

    fn setup() -> (ChallengeProcessor, Arc<ReferenceStore>, StoreContext) {
        let registry = Arc::new(
            EntityRegistry::new(Arc::new(SledStore::temporary().unwrap()))
                .register::<Ref>()
                .register::<ChallengeEntity>(),
        );
        let ctx = registry.begin();
        let refs = Arc::new(ReferenceStore::new(Arc::clone(&registry)));
        refs.ensure_directory_chain(&ctx, "A1", "/").unwrap();
        (ChallengeProcessor::new(registry, Arc::clone(&refs), 1), refs, ctx)
    }

    fn challenge(id: &str) -> ChallengeEntity {
        ChallengeEntity::new(
            id,
            "A1",
            StorageNode {
                id: "b1".into(),
                url: String::new(),
            },
            vec![
                ValidationNode { id: "v1".into(), url: String::new() },
                ValidationNode { id: "v2".into(), url: String::new() },
            ],
            7,
        )
    }

    fn ticket(challenge_id: &str, validator: u8) -> ValidationTicket {
        let mut ticket = ValidationTicket {
            challenge_id: challenge_id.into(),
            blobber_id: "b1".into(),
            validator_id: format!("v{}", validator),
            validator_key: String::new(),
            result: true,
            message: String::new(),
            message_code: String::new(),
            timestamp: 1_700_000_000,
            signature: String::new(),
        };
        ticket.sign(&SigningKey::from_bytes(&[validator; 32]));
        ticket
    }

    #[test]
    fn test_accept_stamps_current_root() {
        let (processor, refs, ctx) = setup();
        let accepted = processor.accept(&ctx, challenge("ch1")).unwrap();
        assert_eq!(accepted.allocation_root, refs.get_root(&ctx, "A1").unwrap().hash);

        let again = processor.accept(&ctx, challenge("ch1")).unwrap();
        assert_eq!(again.creation_date, accepted.creation_date);
    }

    #[test]
    fn test_accept_without_root_fails() {
        let (processor, _, ctx) = setup();
        let mut ch = challenge("ch1");
        ch.allocation_id = "A9".into();
        assert!(processor.accept(&ctx, ch).unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_tickets_reports_rejections() {
        let (processor, _, ctx) = setup();
        processor.accept(&ctx, challenge("ch1")).unwrap();

        let mut forged = ticket("ch1", 2);
        forged.timestamp += 60;
        let outcome = processor
            .add_tickets(&ctx, "ch1", vec![ticket("ch1", 1), forged])
            .unwrap();
        assert_eq!(outcome.accepted, vec!["v1".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, "v2");

        let stored = processor.get(&ctx, "ch1").unwrap();
        assert_eq!(stored.validation_tickets.len(), 1);
    }

    #[test]
    fn test_status_changes_persist() {
        let (processor, _, ctx) = setup();
        processor.accept(&ctx, challenge("ch1")).unwrap();
        processor.accept(&ctx, challenge("ch2")).unwrap();

        processor.mark_error(&ctx, "ch1", "submit failed").unwrap();
        processor.retry(&ctx, "ch1").unwrap();
        processor.mark_error(&ctx, "ch1", "submit failed").unwrap();
        assert!(matches!(
            processor.retry(&ctx, "ch1"),
            Err(StorageError::RetriesExhausted { .. })
        ));

        processor.mark_committed(&ctx, "ch2", "txn", 5).unwrap();
        assert!(processor.mark_failed(&ctx, "ch2", "late").is_err());
        assert_eq!(processor.get(&ctx, "ch2").unwrap().status, ChallengeStatus::Committed);

        let open = processor.list_open(&ctx).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "ch1");
    }
}
