pub mod block;
pub mod service;

pub use block::{Block, NewBlock, GENESIS_PREVIOUS_HASH};
pub use service::{ChainValidation, LedgerService};
