//! Progress reporting for uploads and downloads

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

/// One progress update for a transfer in flight.
///
/// Updates are advisory; the byte counter is non-decreasing but individual
/// messages may be dropped when the channel is full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Remote object path this update refers to
    pub remote_path: String,
    /// Bytes transferred so far
    pub transferred: u64,
    /// Total bytes expected
    pub total: u64,
    /// Percentage in `[0.0, 100.0]`
    pub percent: f64,
}

impl TransferProgress {
    pub fn new(remote_path: &str, transferred: u64, total: u64) -> Self {
        TransferProgress {
            remote_path: remote_path.to_string(),
            transferred,
            total,
            percent: percentage(transferred, total),
        }
    }
}

/// Channel end used by transfer workers to report progress.
///
/// `try_send` is used so a slow consumer never stalls a transfer.
pub type ProgressSender = Sender<TransferProgress>;

/// Send one progress update, dropping it if the channel is full
pub fn report_progress(sender: &Option<ProgressSender>, remote_path: &str, transferred: u64, total: u64) {
    if let Some(tx) = sender {
        let _ = tx.try_send(TransferProgress::new(remote_path, transferred, total));
    }
}

/// Percentage complete, guarding against zero-length transfers
pub fn percentage(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (transferred as f64 / total as f64) * 100.0
    }
}
