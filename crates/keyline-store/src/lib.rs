//! Storage gateway for the Keyline write path.
//!
//! This crate defines the [`StorageGateway`] trait the epoch builder persists
//! through, the bounded per-subscriber [`Fanout`] used for update and epoch
//! notifications, and three adapters:
//!
//! - [`MemoryGateway`]: in-memory maps behind `RwLock`s.
//! - [`FjallGateway`]: durable storage in two fjall keyspaces.
//! - [`FaultyGateway`]: a wrapper injecting latency and failures, for tests.

mod error;
mod faulty_gateway;
mod fanout;
mod fjall_gateway;
mod memory_gateway;
mod traits;

pub use error::StoreError;
pub use faulty_gateway::{FaultyGateway, Operation};
pub use fanout::{DEFAULT_SUBSCRIBER_CAPACITY, Fanout, Subscription, TryRecvError};
pub use fjall_gateway::FjallGateway;
pub use memory_gateway::MemoryGateway;
pub use traits::StorageGateway;
