//! A [`StorageGateway`] wrapper that injects latency and failures.
//!
//! `FaultyGateway` wraps any `Arc<dyn StorageGateway>`. It can sleep for a
//! random, seeded duration before reads and writes, and can be told to fail,
//! hang, lose the acknowledgement of chosen operations, or apply a write long
//! after its caller gave up. It exists to drive the builder through storage
//! outages in tests.
//!
//! # Example
//!
//! ```ignore
//! let faulty = FaultyGateway::new(inner)
//!     .write_latency(1, 5)
//!     .seed(7);
//! faulty.fail_next(Operation::WriteEpochInfo, 2);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyline_types::{EntryStorage, EpochInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::StoreError;
use crate::fanout::Subscription;
use crate::traits::StorageGateway;

/// Gateway operations that faults can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`StorageGateway::read_update`].
    ReadUpdate,
    /// [`StorageGateway::write_update`].
    WriteUpdate,
    /// [`StorageGateway::read_epoch_info`].
    ReadEpochInfo,
    /// [`StorageGateway::write_epoch_info`].
    WriteEpochInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Fail without reaching the inner gateway.
    Fail,
    /// Reach the inner gateway, then report a timeout.
    LoseAck,
    /// Never complete. A write is applied by a background task after the
    /// delay; a read is simply lost.
    LandLate(Duration),
    /// Never complete.
    Hang,
}

/// What the caller of an operation should do after consulting the plan.
enum Action {
    Proceed,
    LoseAck,
    LandLate(Duration),
}

#[derive(Default)]
struct Plan {
    /// Remaining injections per operation; `None` means until healed.
    faults: HashMap<Operation, (Fault, Option<u32>)>,
    calls: HashMap<Operation, u64>,
}

impl Plan {
    fn next_fault(&mut self, op: Operation) -> Option<Fault> {
        *self.calls.entry(op).or_default() += 1;

        let entry = self.faults.get_mut(&op)?;
        let fault = entry.0;
        let exhausted = match &mut entry.1 {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            self.faults.remove(&op);
        }
        Some(fault)
    }
}

/// A [`StorageGateway`] wrapper for fault-injection tests.
pub struct FaultyGateway {
    inner: Arc<dyn StorageGateway>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    plan: Mutex<Plan>,
}

impl FaultyGateway {
    /// Wrap an existing gateway with no latency and no faults.
    pub fn new(inner: Arc<dyn StorageGateway>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            plan: Mutex::new(Plan::default()),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Fail the next `count` calls of `op` with [`StoreError::Unavailable`].
    pub fn fail_next(&self, op: Operation, count: u32) {
        self.inject(op, Fault::Fail, Some(count));
    }

    /// Fail every call of `op` until [`heal`](Self::heal) is called.
    pub fn fail_always(&self, op: Operation) {
        self.inject(op, Fault::Fail, None);
    }

    /// Apply the next `count` calls of `op` to the inner gateway but report
    /// [`StoreError::Timeout`] to the caller.
    pub fn lose_ack_next(&self, op: Operation, count: u32) {
        self.inject(op, Fault::LoseAck, Some(count));
    }

    /// Make the next `count` calls of `op` never answer. Writes among them
    /// still reach the inner gateway, `delay` later, on a background task.
    pub fn land_late_next(&self, op: Operation, count: u32, delay: Duration) {
        self.inject(op, Fault::LandLate(delay), Some(count));
    }

    /// Make every call of `op` hang until healed.
    pub fn hang(&self, op: Operation) {
        self.inject(op, Fault::Hang, None);
    }

    /// Remove any fault configured for `op`.
    pub fn heal(&self, op: Operation) {
        self.plan.lock().expect("lock poisoned").faults.remove(&op);
    }

    /// Remove every configured fault.
    pub fn heal_all(&self) {
        self.plan.lock().expect("lock poisoned").faults.clear();
    }

    /// Number of times `op` has been called, faulted or not.
    pub fn calls(&self, op: Operation) -> u64 {
        self.plan
            .lock()
            .expect("lock poisoned")
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    fn inject(&self, op: Operation, fault: Fault, count: Option<u32>) {
        if count == Some(0) {
            return;
        }
        self.plan
            .lock()
            .expect("lock poisoned")
            .faults
            .insert(op, (fault, count));
    }

    /// Consult the plan for `op`.
    async fn before(&self, op: Operation) -> Result<Action, StoreError> {
        let fault = self.plan.lock().expect("lock poisoned").next_fault(op);
        match fault {
            None => Ok(Action::Proceed),
            Some(Fault::Fail) => {
                debug!(?op, "injecting storage failure");
                Err(StoreError::Unavailable("injected failure".into()))
            }
            Some(Fault::LoseAck) => Ok(Action::LoseAck),
            Some(Fault::LandLate(delay)) => Ok(Action::LandLate(delay)),
            Some(Fault::Hang) => {
                debug!(?op, "injecting storage hang");
                std::future::pending::<()>().await;
                Ok(Action::Proceed)
            }
        }
    }

    /// Like [`before`](Self::before) for a read, where a late landing has
    /// nothing to apply. `Ok(true)` means a lost acknowledgement is due.
    async fn before_read(&self, op: Operation) -> Result<bool, StoreError> {
        match self.before(op).await? {
            Action::Proceed => Ok(false),
            Action::LoseAck => Ok(true),
            Action::LandLate(_) => {
                debug!(?op, "dropping storage read");
                std::future::pending().await
            }
        }
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min >= max {
            min
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn lost_ack(op: Operation) -> StoreError {
    debug!(?op, "dropping storage acknowledgement");
    StoreError::Timeout(Duration::ZERO)
}

/// Run `write` on a background task after `delay` and never answer the
/// caller.
async fn land_late<F>(op: Operation, delay: Duration, write: F) -> Result<(), StoreError>
where
    F: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    debug!(?op, delay_ms = delay.as_millis() as u64, "deferring storage write");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match write.await {
            Ok(()) => debug!(?op, "late write landed"),
            Err(e) => debug!(?op, error = %e, "late write refused"),
        }
    });
    std::future::pending().await
}

#[async_trait::async_trait]
impl StorageGateway for FaultyGateway {
    async fn connect(&self) -> Result<(), StoreError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn read_update(&self, sequence: u64) -> Result<Option<EntryStorage>, StoreError> {
        self.delay(self.read_latency_ms).await;
        let lose = self.before_read(Operation::ReadUpdate).await?;
        let result = self.inner.read_update(sequence).await?;
        if lose {
            return Err(lost_ack(Operation::ReadUpdate));
        }
        Ok(result)
    }

    async fn write_update(&self, record: &EntryStorage) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        let op = Operation::WriteUpdate;
        match self.before(op).await? {
            Action::Proceed => self.inner.write_update(record).await,
            Action::LoseAck => {
                self.inner.write_update(record).await?;
                Err(lost_ack(op))
            }
            Action::LandLate(delay) => {
                let inner = Arc::clone(&self.inner);
                let record = record.clone();
                land_late(op, delay, async move { inner.write_update(&record).await }).await
            }
        }
    }

    async fn read_epoch_info(&self, epoch: u64) -> Result<Option<EpochInfo>, StoreError> {
        self.delay(self.read_latency_ms).await;
        let lose = self.before_read(Operation::ReadEpochInfo).await?;
        let result = self.inner.read_epoch_info(epoch).await?;
        if lose {
            return Err(lost_ack(Operation::ReadEpochInfo));
        }
        Ok(result)
    }

    async fn write_epoch_info(&self, epoch: u64, info: &EpochInfo) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        let op = Operation::WriteEpochInfo;
        match self.before(op).await? {
            Action::Proceed => self.inner.write_epoch_info(epoch, info).await,
            Action::LoseAck => {
                self.inner.write_epoch_info(epoch, info).await?;
                Err(lost_ack(op))
            }
            Action::LandLate(delay) => {
                let inner = Arc::clone(&self.inner);
                let info = info.clone();
                land_late(op, delay, async move { inner.write_epoch_info(epoch, &info).await })
                    .await
            }
        }
    }

    fn subscribe_updates(&self) -> Result<Subscription<EntryStorage>, StoreError> {
        self.inner.subscribe_updates()
    }

    fn subscribe_epoch_info(&self) -> Result<Subscription<EpochInfo>, StoreError> {
        self.inner.subscribe_epoch_info()
    }
}
