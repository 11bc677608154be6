use super::receiver::ReceiverEvent;
use super::reconcile::reserve_file;
use super::tracker::{CompletedTransfer, DownloadTracker};
use crate::config::Settings;
use crate::utils::format_file_size;
use crate::{FileshareError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Owns the completion queue. Every id on it is reassembled at most once;
/// ids whose record was already claimed are ignored.
pub struct Finalizer {
    settings: Arc<Settings>,
    tracker: Arc<DownloadTracker>,
    completed_rx: mpsc::UnboundedReceiver<Uuid>,
    events: broadcast::Sender<ReceiverEvent>,
}

impl Finalizer {
    pub fn new(
        settings: Arc<Settings>,
        tracker: Arc<DownloadTracker>,
        completed_rx: mpsc::UnboundedReceiver<Uuid>,
        events: broadcast::Sender<ReceiverEvent>,
    ) -> Self {
        Self {
            settings,
            tracker,
            completed_rx,
            events,
        }
    }

    pub async fn run(mut self) {
        let mut cleanup = tokio::time::interval(self.settings.cleanup_interval());
        // The first tick fires immediately.
        cleanup.tick().await;

        loop {
            tokio::select! {
                next = self.completed_rx.recv() => match next {
                    Some(transfer_id) => self.finalize(transfer_id).await,
                    None => {
                        debug!("Completion queue closed, finalizer stopping");
                        break;
                    }
                },
                _ = cleanup.tick() => self.sweep().await,
            }
        }
    }

    pub async fn finalize(&self, transfer_id: Uuid) {
        let Some(completed) = self.tracker.take_completed(transfer_id) else {
            debug!("Transfer {} already finalized", transfer_id);
            return;
        };

        match reassemble(&completed, self.settings.transfer.file_buffer_size).await {
            Ok(path) => {
                info!("Transfer {} finalized into {:?}", transfer_id, path);
                let _ = self
                    .events
                    .send(ReceiverEvent::TransferFinalized { transfer_id, path });
            }
            Err(e) => {
                error!(
                    "Failed to finalize transfer {}: {} (parts kept: {:?})",
                    transfer_id, e, completed.part_files
                );
                let _ = self.events.send(ReceiverEvent::FinalizationFailed {
                    transfer_id,
                    error: e.to_string(),
                    part_files: completed.part_files,
                });
            }
        }
    }

    async fn sweep(&self) {
        for expired in self.tracker.sweep_stale(self.settings.stale_transfer_age()) {
            warn!(
                "Transfer {} expired with {}/{} parts",
                expired.transfer_id, expired.parts_completed, expired.total_parts
            );
            remove_parts(&expired.part_files).await;
        }
    }
}

/// Concatenates the part files, in index order, into a fresh file in the
/// transfer's destination directory, then deletes the parts.
pub async fn reassemble(completed: &CompletedTransfer, buffer_size: usize) -> Result<PathBuf> {
    let target = completed.destination_dir.join(&completed.file_name);
    let (path, file) = reserve_file(&target).await?;

    match concatenate(&completed.part_files, file, buffer_size).await {
        Ok(size) => {
            debug!(
                "Reassembled {} parts ({}) into {:?}",
                completed.part_files.len(),
                format_file_size(size),
                path
            );
            remove_parts(&completed.part_files).await;
            Ok(path)
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!("Failed to remove partial output {:?}: {}", path, remove_err);
            }
            Err(e)
        }
    }
}

async fn concatenate(parts: &[PathBuf], output: File, buffer_size: usize) -> Result<u64> {
    let mut writer = BufWriter::with_capacity(buffer_size, output);
    let mut total = 0u64;

    for part in parts {
        let mut reader = File::open(part).await.map_err(|e| {
            FileshareError::FileOperation(format!("Failed to open part {:?}: {}", part, e))
        })?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(total)
}

async fn remove_parts(parts: &[PathBuf]) {
    for part in parts {
        remove_part(part).await;
    }
}

pub(crate) async fn remove_part(part: &Path) {
    if let Err(e) = fs::remove_file(part).await {
        warn!("Failed to remove part file {:?}: {}", part, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reassemble_in_index_order() {
        let dir = tempdir().unwrap();
        let parts: Vec<PathBuf> = ["a.txt0", "a.txt1", "a.txt2"]
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        std::fs::write(&parts[0], b"hel").unwrap();
        std::fs::write(&parts[1], b"lo ").unwrap();
        std::fs::write(&parts[2], b"world").unwrap();

        let completed = CompletedTransfer {
            transfer_id: Uuid::new_v4(),
            file_name: "a.txt".to_string(),
            destination_dir: dir.path().to_path_buf(),
            part_files: parts.clone(),
        };

        let path = reassemble(&completed, 4).await.unwrap();
        assert_eq!(path, dir.path().join("a.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(parts.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_reassemble_does_not_overwrite_existing_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"older").unwrap();
        let part = dir.path().join("a.txt0");
        std::fs::write(&part, b"newer").unwrap();

        let completed = CompletedTransfer {
            transfer_id: Uuid::new_v4(),
            file_name: "a.txt".to_string(),
            destination_dir: dir.path().to_path_buf(),
            part_files: vec![part],
        };

        let path = reassemble(&completed, 1024).await.unwrap();
        assert_eq!(path, dir.path().join("a_1.txt"));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"older");
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_missing_part_leaves_no_output() {
        let dir = tempdir().unwrap();
        let completed = CompletedTransfer {
            transfer_id: Uuid::new_v4(),
            file_name: "a.txt".to_string(),
            destination_dir: dir.path().to_path_buf(),
            part_files: vec![dir.path().join("missing0")],
        };

        assert!(reassemble(&completed, 1024).await.is_err());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_finalization_reports_kept_parts() {
        let dir = tempdir().unwrap();
        let (tracker, completed_rx) = DownloadTracker::new();
        let (events, mut events_rx) = broadcast::channel(16);
        let finalizer = Finalizer::new(
            Arc::new(Settings::default()),
            tracker.clone(),
            completed_rx,
            events,
        );

        let id = Uuid::new_v4();
        let destination = dir.path().to_path_buf();
        tracker
            .get_or_create(id, "c.bin", 2, || async move { Ok(destination) })
            .await
            .unwrap();
        let present = dir.path().join("c.bin0");
        let missing = dir.path().join("c.bin1");
        std::fs::write(&present, b"kept").unwrap();
        tracker.record_part_complete(id, 0, present.clone()).unwrap();
        assert!(tracker.record_part_complete(id, 1, missing.clone()).unwrap());

        finalizer.finalize(id).await;

        match events_rx.recv().await.unwrap() {
            ReceiverEvent::FinalizationFailed {
                transfer_id,
                part_files,
                ..
            } => {
                assert_eq!(transfer_id, id);
                assert_eq!(part_files, vec![present.clone(), missing]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(std::fs::read(&present).unwrap(), b"kept");
        assert!(!dir.path().join("c.bin").exists());
    }

    #[tokio::test]
    async fn test_finalize_runs_once_per_transfer() {
        let dir = tempdir().unwrap();
        let (tracker, completed_rx) = DownloadTracker::new();
        let (events, mut events_rx) = broadcast::channel(16);
        let finalizer = Finalizer::new(
            Arc::new(Settings::default()),
            tracker.clone(),
            completed_rx,
            events,
        );

        let id = Uuid::new_v4();
        let destination = dir.path().to_path_buf();
        tracker
            .get_or_create(id, "b.bin", 1, || async move { Ok(destination) })
            .await
            .unwrap();
        let part = dir.path().join("b.bin0");
        std::fs::write(&part, b"payload").unwrap();
        assert!(tracker.record_part_complete(id, 0, part).unwrap());

        finalizer.finalize(id).await;
        finalizer.finalize(id).await;

        match events_rx.recv().await.unwrap() {
            ReceiverEvent::TransferFinalized { transfer_id, path } => {
                assert_eq!(transfer_id, id);
                assert_eq!(std::fs::read(path).unwrap(), b"payload");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events_rx.try_recv().is_err());
        assert!(!dir.path().join("b_1.bin").exists());
    }
}
