//! Rebuilding builder state from the gateway's durable log.

use std::collections::VecDeque;
use std::sync::Arc;

use keyline_index::{SparseMerkleTree, empty_root};
use keyline_store::StorageGateway;
use keyline_types::{EntryStorage, EpochInfo, GENESIS_EPOCH};
use tracing::{debug, info, warn};

use crate::builder::retain_sealed;
use crate::config::BuilderConfig;
use crate::epoch::SealedEpoch;
use crate::error::BuilderError;
use crate::retry::with_retry;
use crate::validator::validate;

/// State reconstructed by [`replay`].
pub(crate) struct Recovered {
    pub index: SparseMerkleTree,
    pub last_sealed: EpochInfo,
    pub next_sequence: u64,
    pub sealed: VecDeque<Arc<SealedEpoch>>,
}

/// Replay the epoch chain and update log held by `gateway`.
///
/// Verifies that epochs are contiguous from genesis, that each links to its
/// predecessor, and that replaying the updates up to each epoch's
/// `last_sequence` reproduces its root. Updates after the last sealed epoch
/// are replayed into the open epoch. An update records the epoch that was
/// open when it was written; one whose write was never acknowledged may be
/// adopted, and so sealed, in a later epoch, but never in an earlier one.
/// An empty gateway receives the genesis epoch.
pub(crate) async fn replay(
    gateway: &dyn StorageGateway,
    config: &BuilderConfig,
) -> Result<Recovered, BuilderError> {
    let reader = Reader { gateway, config };

    let genesis = match reader.epoch(GENESIS_EPOCH).await? {
        Some(stored) => {
            if !stored.same_content(&EpochInfo::genesis(empty_root())) {
                return Err(BuilderError::Corruption(
                    "genesis epoch does not commit to the empty index".into(),
                ));
            }
            stored
        }
        None => {
            if reader.update(1).await?.is_some() {
                return Err(BuilderError::Corruption(
                    "updates present without a genesis epoch".into(),
                ));
            }
            let genesis = EpochInfo::genesis(empty_root());
            with_retry(&config.retry, config.storage_deadline, "write_epoch_info", || {
                gateway.write_epoch_info(GENESIS_EPOCH, &genesis)
            })
            .await?;
            info!(root = %genesis.root, "wrote genesis epoch");
            genesis
        }
    };

    let mut index = SparseMerkleTree::new();
    let mut next_sequence = 1;
    let mut sealed = VecDeque::new();
    retain_sealed(
        &mut sealed,
        SealedEpoch::new(genesis.clone(), index.clone()),
        config.retained_epochs,
    );
    let mut last = genesis;

    loop {
        let number = last.epoch + 1;
        let Some(info) = reader.epoch(number).await? else {
            break;
        };

        if !info.follows(&last) {
            return Err(BuilderError::Corruption(format!(
                "epoch {number} does not link to epoch {}",
                last.epoch
            )));
        }
        if info.first_sequence != next_sequence
            || info.last_sequence + 1 < info.first_sequence
            || info.update_count != info.last_sequence + 1 - info.first_sequence
        {
            return Err(BuilderError::Corruption(format!(
                "epoch {number} covers sequences {}..={} ({} updates), expected to start at {next_sequence}",
                info.first_sequence, info.last_sequence, info.update_count
            )));
        }

        while next_sequence <= info.last_sequence {
            let record = reader.update(next_sequence).await?.ok_or_else(|| {
                BuilderError::Corruption(format!(
                    "update {next_sequence} sealed in epoch {number} is missing"
                ))
            })?;
            if record.epoch > number || record.epoch == GENESIS_EPOCH {
                return Err(BuilderError::Corruption(format!(
                    "update {next_sequence} claims epoch {}, sealed in epoch {number}",
                    record.epoch
                )));
            }
            apply(&mut index, &record, next_sequence)?;
            next_sequence += 1;
        }

        let replayed = index.root();
        if replayed != info.root {
            return Err(BuilderError::Corruption(format!(
                "epoch {number} root mismatch: stored {}, replayed {replayed}",
                info.root
            )));
        }

        debug!(epoch = number, root = %replayed, "verified sealed epoch");
        retain_sealed(
            &mut sealed,
            SealedEpoch::new(info.clone(), index.clone()),
            config.retained_epochs,
        );
        last = info;
    }

    let open_epoch = last.epoch + 1;
    let mut open_updates = 0u64;
    while let Some(record) = reader.update(next_sequence).await? {
        if record.epoch > open_epoch {
            return Err(BuilderError::Corruption(format!(
                "update {next_sequence} claims future epoch {}",
                record.epoch
            )));
        }
        apply(&mut index, &record, next_sequence)?;
        if record.epoch < open_epoch {
            warn!(
                sequence = next_sequence,
                epoch = record.epoch,
                open_epoch,
                "adopting unacknowledged update into the open epoch"
            );
        }
        next_sequence += 1;
        open_updates += 1;
    }

    info!(
        last_sealed_epoch = last.epoch,
        open_epoch,
        open_updates,
        next_sequence,
        root = %index.root(),
        "recovered builder state"
    );

    Ok(Recovered {
        index,
        last_sealed: last,
        next_sequence,
        sealed,
    })
}

fn apply(
    index: &mut SparseMerkleTree,
    record: &EntryStorage,
    expected: u64,
) -> Result<(), BuilderError> {
    if record.sequence != expected {
        return Err(BuilderError::Corruption(format!(
            "update stored under sequence {expected} carries sequence {}",
            record.sequence
        )));
    }
    let validated = validate(&record.update).map_err(|e| {
        BuilderError::Corruption(format!("update {expected} fails validation: {e}"))
    })?;
    index.insert(validated.key, validated.value);
    Ok(())
}

struct Reader<'a> {
    gateway: &'a dyn StorageGateway,
    config: &'a BuilderConfig,
}

impl Reader<'_> {
    async fn epoch(&self, epoch: u64) -> Result<Option<EpochInfo>, BuilderError> {
        let info = with_retry(
            &self.config.retry,
            self.config.storage_deadline,
            "read_epoch_info",
            || self.gateway.read_epoch_info(epoch),
        )
        .await?;
        Ok(info)
    }

    async fn update(&self, sequence: u64) -> Result<Option<EntryStorage>, BuilderError> {
        let record = with_retry(
            &self.config.retry,
            self.config.storage_deadline,
            "read_update",
            || self.gateway.read_update(sequence),
        )
        .await?;
        Ok(record)
    }
}
