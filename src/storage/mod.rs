//! Durable storage: the order queue engine and the ticket mapping substore.

pub mod order_store;
pub mod ticket_map;

pub use order_store::{
    retry_backoff, AckOutcome, IngestOutcome, OrderStore, QueueStats, ReapOutcome, RetryOutcome,
    CLAIM_CEILING,
};
pub use ticket_map::TicketMapStore;
