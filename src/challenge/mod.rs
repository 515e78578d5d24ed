//! Storage challenges and validator attestation
//!
//! A challenge asks the blobber to prove it still holds an allocation's
//! content. The blobber commits to its current root hash when accepting;
//! independent validators then sign tickets attesting to the response. This
//! module authenticates those tickets and tracks the challenge status. How
//! many successful tickets make a pass is decided by the caller.

pub mod entity;
pub mod processor;
pub mod ticket;

pub use entity::{ChallengeEntity, ChallengeStatus, StorageNode, TicketTally, ValidationNode};
pub use processor::{ChallengeProcessor, TicketOutcome};
pub use ticket::ValidationTicket;
