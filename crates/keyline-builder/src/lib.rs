//! Write path of the Keyline key-transparency log.
//!
//! The [`EpochBuilder`] accepts [`SignedEntryUpdate`](keyline_types::SignedEntryUpdate)s,
//! checks them with the [`validator`] and an [`UpdateAuthorizer`], persists
//! each admitted update through a
//! [`StorageGateway`](keyline_store::StorageGateway), and applies it to the
//! identity index. [`EpochBuilder::seal`] freezes the index into a numbered,
//! hash-chained [`EpochInfo`](keyline_types::EpochInfo).
//!
//! ```text
//! post ──► validate ──► authorize ──► write_update ──► index insert
//!                                                           │
//! seal ──► snapshot + EpochInfo ──► write_epoch_info ──► next epoch opens
//! ```

pub mod authorizer;
pub mod builder;
pub mod config;
pub mod epoch;
pub mod error;
mod recovery;
mod retry;
pub mod validator;

pub use authorizer::{AllowAll, Ed25519Authorizer, UpdateAuthorizer};
pub use builder::EpochBuilder;
pub use config::{BuilderConfig, RetryPolicy};
pub use epoch::{BuilderStatus, EpochPhase, SealedEpoch};
pub use error::{BuilderError, StatusCode, status_of};
pub use validator::{ValidatedUpdate, ValidationError, validate};

#[cfg(test)]
mod tests;
