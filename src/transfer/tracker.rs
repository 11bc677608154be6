//! Receiver-side bookkeeping of in-flight transfers.
//!
//! Records are only reachable through the tracker's methods. Each transfer
//! id owns a slot whose record is initialized at most once, so concurrent
//! first parts of the same transfer agree on a single destination
//! directory. The part that completes a transfer pushes its id onto the
//! completion channel; nothing scans the table for finished work.

use crate::{FileshareError, Result};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Immutable facts about a transfer, handed to connection tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub total_parts: u32,
    pub destination_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub transfer_id: Uuid,
    pub total_parts: u32,
    pub parts_completed: u32,
    pub parts_failed: u32,
    pub parts_in_flight: u32,
    pub destination_dir: PathBuf,
    /// Part files in index order.
    pub part_files: Vec<PathBuf>,
    pub is_complete: bool,
}

/// A transfer claimed for finalization. Produced once per transfer id.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub destination_dir: PathBuf,
    pub part_files: Vec<PathBuf>,
}

#[derive(Debug)]
struct Progress {
    parts_completed: u32,
    parts_failed: u32,
    /// Part connections currently streaming into this transfer.
    parts_in_flight: u32,
    part_files: BTreeMap<u32, PathBuf>,
    is_complete: bool,
    last_activity: Instant,
}

#[derive(Debug)]
struct ActiveTransfer {
    handle: TransferHandle,
    progress: Mutex<Progress>,
}

impl ActiveTransfer {
    fn new(handle: TransferHandle) -> Self {
        Self {
            handle,
            progress: Mutex::new(Progress {
                parts_completed: 0,
                parts_failed: 0,
                parts_in_flight: 0,
                part_files: BTreeMap::new(),
                is_complete: false,
                last_activity: Instant::now(),
            }),
        }
    }

    fn snapshot(&self) -> TransferSnapshot {
        let progress = lock(&self.progress);
        TransferSnapshot {
            transfer_id: self.handle.transfer_id,
            total_parts: self.handle.total_parts,
            parts_completed: progress.parts_completed,
            parts_failed: progress.parts_failed,
            parts_in_flight: progress.parts_in_flight,
            destination_dir: self.handle.destination_dir.clone(),
            part_files: progress.part_files.values().cloned().collect(),
            is_complete: progress.is_complete,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    record: OnceCell<ActiveTransfer>,
}

pub struct DownloadTracker {
    transfers: Mutex<HashMap<Uuid, Arc<Slot>>>,
    /// Ids claimed by `take_completed`, kept until the next sweep past
    /// their age so late parts are refused instead of reopening them.
    finalized: Mutex<HashMap<Uuid, Instant>>,
    completed_tx: mpsc::UnboundedSender<Uuid>,
}

impl DownloadTracker {
    /// The receiver yields each transfer id exactly once, when its last
    /// part lands.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let tracker = Self {
            transfers: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
            completed_tx,
        };
        (Arc::new(tracker), completed_rx)
    }

    /// Returns the record for `transfer_id`, creating it with `init`'s
    /// directory if this is the first part seen. `init` runs at most once
    /// per transfer id even when called concurrently; losers wait for the
    /// winner and get `created == false`.
    pub async fn get_or_create<F, Fut>(
        &self,
        transfer_id: Uuid,
        file_name: &str,
        total_parts: u32,
        init: F,
    ) -> Result<(TransferHandle, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        if total_parts == 0 {
            return Err(FileshareError::Protocol(format!(
                "transfer {} declares zero parts",
                transfer_id
            )));
        }

        let slot = {
            let mut transfers = lock(&self.transfers);
            if lock(&self.finalized).contains_key(&transfer_id) {
                return Err(FileshareError::Transfer(format!(
                    "transfer {} was already finalized",
                    transfer_id
                )));
            }
            transfers.entry(transfer_id).or_default().clone()
        };

        let created = AtomicBool::new(false);
        let created_flag = &created;
        let record = slot
            .record
            .get_or_try_init(move || async move {
                let destination_dir = init().await?;
                created_flag.store(true, Ordering::Relaxed);
                info!(
                    "Tracking transfer {} ({} parts of {:?}) in {:?}",
                    transfer_id, total_parts, file_name, destination_dir
                );
                Ok::<_, FileshareError>(ActiveTransfer::new(TransferHandle {
                    transfer_id,
                    file_name: file_name.to_string(),
                    total_parts,
                    destination_dir,
                }))
            })
            .await?;

        if record.handle.total_parts != total_parts {
            return Err(FileshareError::Protocol(format!(
                "transfer {} announced {} parts, part claims {}",
                transfer_id, record.handle.total_parts, total_parts
            )));
        }

        Ok((record.handle.clone(), created.into_inner()))
    }

    /// Counts part `part_index` as landed at `part_file`. Returns true for
    /// exactly one call per transfer: the one that completes it, which also
    /// queues the transfer for finalization.
    pub fn record_part_complete(
        &self,
        transfer_id: Uuid,
        part_index: u32,
        part_file: PathBuf,
    ) -> Result<bool> {
        let slot = self.slot(transfer_id)?;
        let record = initialized(&slot, transfer_id)?;
        let total_parts = record.handle.total_parts;

        let mut progress = lock(&record.progress);
        progress.parts_in_flight = progress.parts_in_flight.saturating_sub(1);
        progress.last_activity = Instant::now();
        if progress.is_complete {
            return Err(FileshareError::Transfer(format!(
                "transfer {} is already complete",
                transfer_id
            )));
        }
        if part_index >= total_parts {
            return Err(FileshareError::Protocol(format!(
                "part {} out of range for transfer {} with {} parts",
                part_index, transfer_id, total_parts
            )));
        }
        if progress.part_files.contains_key(&part_index) {
            return Err(FileshareError::Transfer(format!(
                "part {} of transfer {} already received",
                part_index, transfer_id
            )));
        }

        progress.part_files.insert(part_index, part_file);
        progress.parts_completed += 1;
        debug!(
            "Transfer {}: {}/{} parts received",
            transfer_id, progress.parts_completed, total_parts
        );

        if progress.parts_completed < total_parts {
            return Ok(false);
        }

        progress.is_complete = true;
        if self.completed_tx.send(transfer_id).is_err() {
            warn!(
                "Transfer {} completed but no finalizer is listening",
                transfer_id
            );
        }
        Ok(true)
    }

    /// Marks a part connection as streaming. A transfer with parts in
    /// flight is never swept. Every call must be matched by
    /// `record_part_complete` or `record_part_failed`.
    pub fn part_started(&self, transfer_id: Uuid, part_index: u32) -> Result<()> {
        let slot = self.slot(transfer_id)?;
        let record = initialized(&slot, transfer_id)?;

        let mut progress = lock(&record.progress);
        progress.parts_in_flight += 1;
        progress.last_activity = Instant::now();
        debug!(
            "Transfer {}: part {} started ({} in flight)",
            transfer_id, part_index, progress.parts_in_flight
        );
        Ok(())
    }

    /// Notes a part that died mid-stream. The record stays open so the
    /// sender can retry that part.
    pub fn record_part_failed(&self, transfer_id: Uuid, part_index: u32) {
        let Ok(slot) = self.slot(transfer_id) else {
            return;
        };
        if let Some(record) = slot.record.get() {
            let mut progress = lock(&record.progress);
            progress.parts_in_flight = progress.parts_in_flight.saturating_sub(1);
            progress.parts_failed += 1;
            progress.last_activity = Instant::now();
            warn!(
                "Part {} of transfer {} failed ({} failures so far)",
                part_index, transfer_id, progress.parts_failed
            );
        }
    }

    /// Removes and returns a complete transfer. Only the first caller for a
    /// given id gets `Some`.
    pub fn take_completed(&self, transfer_id: Uuid) -> Option<CompletedTransfer> {
        let mut transfers = lock(&self.transfers);

        let record = transfers.get(&transfer_id)?.record.get()?;
        let part_files = {
            let progress = lock(&record.progress);
            if !progress.is_complete {
                return None;
            }
            progress.part_files.values().cloned().collect()
        };
        let completed = CompletedTransfer {
            transfer_id,
            file_name: record.handle.file_name.clone(),
            destination_dir: record.handle.destination_dir.clone(),
            part_files,
        };

        transfers.remove(&transfer_id);
        lock(&self.finalized).insert(transfer_id, Instant::now());
        Some(completed)
    }

    pub fn remove(&self, transfer_id: Uuid) -> Option<TransferSnapshot> {
        let slot = lock(&self.transfers).remove(&transfer_id)?;
        slot.record.get().map(ActiveTransfer::snapshot)
    }

    pub fn snapshot(&self, transfer_id: Uuid) -> Option<TransferSnapshot> {
        let slot = self.slot(transfer_id).ok()?;
        slot.record.get().map(ActiveTransfer::snapshot)
    }

    /// Drops incomplete transfers idle for longer than `max_age` with no
    /// part streaming, plus slots whose initialization failed and that
    /// nobody is waiting on. Finalized ids older than `max_age` are
    /// forgotten.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<TransferSnapshot> {
        lock(&self.finalized).retain(|_, finalized_at| finalized_at.elapsed() <= max_age);

        let mut transfers = lock(&self.transfers);
        let mut expired = Vec::new();

        transfers.retain(|transfer_id, slot| match slot.record.get() {
            Some(record) => {
                let progress = lock(&record.progress);
                let stale = !progress.is_complete
                    && progress.parts_in_flight == 0
                    && progress.last_activity.elapsed() > max_age;
                drop(progress);
                if stale {
                    warn!("Dropping stale transfer {}", transfer_id);
                    expired.push(record.snapshot());
                }
                !stale
            }
            None => Arc::strong_count(slot) > 1,
        });

        expired
    }

    pub fn len(&self) -> usize {
        lock(&self.transfers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, transfer_id: Uuid) -> Result<Arc<Slot>> {
        lock(&self.transfers)
            .get(&transfer_id)
            .cloned()
            .ok_or_else(|| FileshareError::Transfer(format!("unknown transfer {}", transfer_id)))
    }
}

fn initialized(slot: &Slot, transfer_id: Uuid) -> Result<&ActiveTransfer> {
    slot.record.get().ok_or_else(|| {
        FileshareError::Transfer(format!("transfer {} is not initialized", transfer_id))
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
