//! [`EpochBuilder`]: admission of updates and sealing of epochs.
//!
//! One `tokio::sync::Mutex` guards the index, the sequence counter and the
//! epoch counter. An update is persisted while that lock is held, so the
//! order in which updates are admitted is the order of their sequence
//! numbers and the order in which recovery replays them.
//!
//! Sequences are write-once in the gateway. A write that failed ambiguously
//! may still land later; if it does, the next post finds its sequence taken,
//! indexes the stored record and moves on to the following sequence, so the
//! index always matches the durable log.
//!
//! Sealing takes a separate lock so that only one seal runs at a time. The
//! `EpochInfo` is computed under the state lock, then persisted without it;
//! during that window the builder is [`EpochPhase::Sealing`] and refuses
//! submissions.

use std::collections::VecDeque;
use std::sync::Arc;

use keyline_index::SparseMerkleTree;
use keyline_store::{StorageGateway, StoreError};
use keyline_types::{Digest, Entry, EntryStorage, EpochInfo, IdentityKey, SignedEntryUpdate, now_millis};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::authorizer::{AllowAll, UpdateAuthorizer};
use crate::config::BuilderConfig;
use crate::epoch::{BuilderStatus, EpochPhase, SealedEpoch};
use crate::error::BuilderError;
use crate::recovery;
use crate::retry::with_retry;
use crate::validator::{ValidatedUpdate, validate};

/// An `EpochInfo` whose persistence has not been acknowledged yet.
struct PendingSeal {
    info: EpochInfo,
    index: SparseMerkleTree,
}

struct State {
    phase: EpochPhase,
    index: SparseMerkleTree,
    next_sequence: u64,
    last_sealed: EpochInfo,
    pending: Option<PendingSeal>,
    sealed: VecDeque<Arc<SealedEpoch>>,
}

impl State {
    fn open_epoch(&self) -> u64 {
        self.last_sealed.epoch + 1
    }

    fn first_sequence(&self) -> u64 {
        self.last_sealed.last_sequence + 1
    }

    fn pending_updates(&self) -> u64 {
        self.next_sequence - self.first_sequence()
    }

    fn ensure_admitting(&self) -> Result<(), BuilderError> {
        match self.phase {
            EpochPhase::Open => Ok(()),
            EpochPhase::Sealing => Err(BuilderError::EpochSealing {
                epoch: self.open_epoch(),
            }),
            EpochPhase::Closed => Err(BuilderError::Closed),
        }
    }

    fn ensure_not_closed(&self) -> Result<(), BuilderError> {
        if self.phase == EpochPhase::Closed {
            Err(BuilderError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Keep at most `limit` snapshots, dropping the oldest.
pub(crate) fn retain_sealed(
    sealed: &mut VecDeque<Arc<SealedEpoch>>,
    epoch: SealedEpoch,
    limit: usize,
) {
    sealed.push_back(Arc::new(epoch));
    while sealed.len() > limit {
        sealed.pop_front();
    }
}

/// Owns the identity index and drives the epoch state machine.
pub struct EpochBuilder {
    gateway: Arc<dyn StorageGateway>,
    authorizer: Arc<dyn UpdateAuthorizer>,
    config: BuilderConfig,
    state: Mutex<State>,
    seal_lock: Mutex<()>,
    sealer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EpochBuilder {
    /// Connect to `gateway`, recover its log and accept every update.
    pub async fn open(
        gateway: Arc<dyn StorageGateway>,
        config: BuilderConfig,
    ) -> Result<Self, BuilderError> {
        Self::recover(gateway, Arc::new(AllowAll), config).await
    }

    /// Connect to `gateway`, recover its log and authorize updates with
    /// `authorizer`.
    ///
    /// Replays every sealed epoch and verifies its root, then replays the
    /// updates admitted after the last seal into the open epoch. An empty
    /// gateway receives the genesis epoch. Replayed updates are not
    /// re-authorized.
    pub async fn recover(
        gateway: Arc<dyn StorageGateway>,
        authorizer: Arc<dyn UpdateAuthorizer>,
        config: BuilderConfig,
    ) -> Result<Self, BuilderError> {
        gateway.connect().await?;
        let recovered = recovery::replay(gateway.as_ref(), &config).await?;

        Ok(Self {
            gateway,
            authorizer,
            config,
            state: Mutex::new(State {
                phase: EpochPhase::Open,
                index: recovered.index,
                next_sequence: recovered.next_sequence,
                last_sealed: recovered.last_sealed,
                pending: None,
                sealed: recovered.sealed,
            }),
            seal_lock: Mutex::new(()),
            sealer: std::sync::Mutex::new(None),
        })
    }

    /// The gateway this builder persists through.
    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    /// The configuration this builder was opened with.
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Validate, authorize, persist and index a signed update.
    ///
    /// Returns the durable record once the gateway has acknowledged it. On
    /// error the update is not indexed. An earlier write that was never
    /// acknowledged but did land is indexed first, under its own sequence.
    pub async fn post(&self, update: SignedEntryUpdate) -> Result<EntryStorage, BuilderError> {
        self.admit(update, None).await
    }

    /// Admit the update carried by a storage record.
    ///
    /// The record's sequence and epoch are reassigned by this builder. A
    /// non-zero `admitted_at` is kept.
    pub async fn post_storage(&self, record: EntryStorage) -> Result<EntryStorage, BuilderError> {
        let admitted_at = Some(record.admitted_at).filter(|&t| t != 0);
        self.admit(record.update, admitted_at).await
    }

    async fn admit(
        &self,
        update: SignedEntryUpdate,
        admitted_at: Option<u64>,
    ) -> Result<EntryStorage, BuilderError> {
        let validated = validate(&update).inspect_err(|e| {
            debug!(error = %e, "rejected malformed update");
        })?;

        let mut state = self.state.lock().await;
        state.ensure_admitting()?;

        self.authorize(&state, &validated, &update)?;

        let mut record = EntryStorage {
            sequence: state.next_sequence,
            epoch: state.open_epoch(),
            admitted_at: admitted_at.unwrap_or_else(now_millis),
            update,
        };

        loop {
            let written = with_retry(
                &self.config.retry,
                self.config.storage_deadline,
                "write_update",
                || self.gateway.write_update(&record),
            )
            .await;

            match written {
                Ok(()) => break,
                Err(StoreError::Conflict(sequence)) if sequence == record.sequence => {
                    self.adopt_stored(&mut state).await?;
                    // The adopted update may have changed who may write this key.
                    self.authorize(&state, &validated, &record.update)?;
                    record.sequence = state.next_sequence;
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.index.insert(validated.key, validated.value);
        state.next_sequence += 1;

        debug!(
            sequence = record.sequence,
            epoch = record.epoch,
            key = %validated.key,
            "admitted update"
        );
        Ok(record)
    }

    /// Check `update` against the entry currently indexed under its key.
    fn authorize(
        &self,
        state: &State,
        validated: &ValidatedUpdate,
        update: &SignedEntryUpdate,
    ) -> Result<(), BuilderError> {
        let previous = state
            .index
            .get(&validated.key)
            .and_then(|bytes| Entry::decode(bytes).ok());
        self.authorizer
            .authorize(validated, previous.as_ref(), update)
            .inspect_err(|e| debug!(key = %validated.key, error = %e, "rejected update"))?;
        Ok(())
    }

    /// Index the record already stored under the next sequence: an earlier
    /// post whose write landed after its caller was told it failed.
    async fn adopt_stored(&self, state: &mut State) -> Result<(), BuilderError> {
        let sequence = state.next_sequence;
        let stored = with_retry(
            &self.config.retry,
            self.config.storage_deadline,
            "read_update",
            || self.gateway.read_update(sequence),
        )
        .await?
        .ok_or_else(|| {
            BuilderError::Corruption(format!("update {sequence} conflicts but is not stored"))
        })?;

        let validated = validate(&stored.update).map_err(|e| {
            BuilderError::Corruption(format!("stored update {sequence} fails validation: {e}"))
        })?;
        warn!(
            sequence,
            epoch = stored.epoch,
            key = %validated.key,
            "adopting unacknowledged update"
        );
        state.index.insert(validated.key, validated.value);
        state.next_sequence += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sealing
    // ------------------------------------------------------------------

    /// Seal the open epoch.
    ///
    /// - If an earlier attempt failed to persist its `EpochInfo`, the same
    ///   record is persisted again.
    /// - If no update was admitted since the last seal, the last sealed
    ///   `EpochInfo` is returned and no epoch is created.
    /// - Otherwise a new `EpochInfo` is built over a snapshot of the index,
    ///   persisted, and the next epoch opens.
    ///
    /// If persistence fails the builder stays [`EpochPhase::Sealing`] and
    /// rejects submissions until a later `seal()` succeeds.
    pub async fn seal(&self) -> Result<EpochInfo, BuilderError> {
        let _sealing = self.seal_lock.lock().await;

        let (info, index) = {
            let mut state = self.state.lock().await;
            state.ensure_not_closed()?;

            if let Some(pending) = &state.pending {
                debug!(epoch = pending.info.epoch, "retrying pending seal");
                (pending.info.clone(), pending.index.clone())
            } else if state.pending_updates() == 0 {
                debug!(epoch = state.last_sealed.epoch, "nothing to seal");
                return Ok(state.last_sealed.clone());
            } else {
                let info = EpochInfo {
                    epoch: state.open_epoch(),
                    root: state.index.root(),
                    previous: state.last_sealed.digest(),
                    first_sequence: state.first_sequence(),
                    last_sequence: state.next_sequence - 1,
                    update_count: state.pending_updates(),
                    sealed_at: now_millis(),
                };
                let index = state.index.clone();
                state.pending = Some(PendingSeal {
                    info: info.clone(),
                    index: index.clone(),
                });
                state.phase = EpochPhase::Sealing;
                (info, index)
            }
        };

        let persisted = with_retry(
            &self.config.retry,
            self.config.storage_deadline,
            "write_epoch_info",
            || self.gateway.write_epoch_info(info.epoch, &info),
        )
        .await;

        if let Err(e) = persisted {
            warn!(epoch = info.epoch, error = %e, "failed to persist epoch, seal pending");
            return Err(e.into());
        }

        let mut state = self.state.lock().await;
        state.ensure_not_closed()?;

        state.pending = None;
        state.phase = EpochPhase::Open;
        state.last_sealed = info.clone();
        retain_sealed(
            &mut state.sealed,
            SealedEpoch::new(info.clone(), index),
            self.config.retained_epochs,
        );

        info!(
            epoch = info.epoch,
            root = %info.root,
            updates = info.update_count,
            last_sequence = info.last_sequence,
            "sealed epoch"
        );
        Ok(info)
    }

    /// Seal every `seal_interval` on a background task until the builder
    /// is closed or dropped. Failures are logged and retried on the next
    /// tick.
    pub fn spawn_sealer(self: &Arc<Self>) {
        let builder = Arc::downgrade(self);
        let period = self.config.seal_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(builder) = builder.upgrade() else {
                    break;
                };
                match builder.seal().await {
                    Ok(info) => debug!(epoch = info.epoch, "periodic seal complete"),
                    Err(BuilderError::Closed) => break,
                    Err(e) => warn!(error = %e, "periodic seal failed"),
                }
            }
        });

        if let Some(previous) = self.sealer.lock().expect("lock poisoned").replace(handle) {
            previous.abort();
        }
        debug!(interval_ms = period.as_millis() as u64, "started periodic sealer");
    }

    /// Stop the background sealer and release all in-memory state.
    ///
    /// Does not seal. Every later operation fails with
    /// [`BuilderError::Closed`]. The gateway stays connected.
    pub async fn close(&self) {
        if let Some(handle) = self.sealer.lock().expect("lock poisoned").take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        if state.phase == EpochPhase::Closed {
            return;
        }

        let unsealed = state.pending_updates();
        state.phase = EpochPhase::Closed;
        state.index = SparseMerkleTree::new();
        state.pending = None;
        state.sealed.clear();
        info!(unsealed, "epoch builder closed");
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Value currently committed for `key` in the live index.
    pub async fn lookup(&self, key: &IdentityKey) -> Result<Option<Vec<u8>>, BuilderError> {
        let state = self.state.lock().await;
        state.ensure_not_closed()?;
        Ok(state.index.get(key).map(<[u8]>::to_vec))
    }

    /// Root digest of the live index.
    pub async fn root(&self) -> Result<Digest, BuilderError> {
        let state = self.state.lock().await;
        state.ensure_not_closed()?;
        Ok(state.index.root())
    }

    /// Summary of the builder's current state.
    pub async fn state(&self) -> BuilderStatus {
        let state = self.state.lock().await;
        BuilderStatus {
            phase: state.phase,
            open_epoch: state.open_epoch(),
            last_sealed_epoch: state.last_sealed.epoch,
            next_sequence: state.next_sequence,
            pending_updates: state.pending_updates(),
            index_len: state.index.len(),
        }
    }

    /// The most recently sealed epoch record.
    pub async fn last_sealed(&self) -> Result<EpochInfo, BuilderError> {
        let state = self.state.lock().await;
        state.ensure_not_closed()?;
        Ok(state.last_sealed.clone())
    }

    /// The computed but unpersisted epoch record, if a seal is pending.
    pub async fn pending_seal(&self) -> Option<EpochInfo> {
        let state = self.state.lock().await;
        state.pending.as_ref().map(|p| p.info.clone())
    }

    /// A retained sealed epoch and its frozen index.
    pub async fn sealed_epoch(&self, epoch: u64) -> Option<Arc<SealedEpoch>> {
        let state = self.state.lock().await;
        state
            .sealed
            .iter()
            .rev()
            .find(|sealed| sealed.info().epoch == epoch)
            .cloned()
    }
}

impl Drop for EpochBuilder {
    fn drop(&mut self) {
        if let Ok(mut sealer) = self.sealer.lock()
            && let Some(handle) = sealer.take()
        {
            handle.abort();
        }
    }
}
