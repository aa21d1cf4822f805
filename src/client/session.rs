//! Per-(job, task attempt) upload bookkeeping.

use std::collections::BTreeMap;

use crate::common::AppTaskAttemptId;
use crate::protocol::PartitionId;

/// Status of an upload session.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UploadStatus {
    Started,
    Finished,
    Failed,
}

/// State of one upload, living from `start_upload` to `finish_upload`.
/// Owned exclusively by the client that created it.
#[derive(Debug, Clone)]
pub struct UploadSession {
    attempt: AppTaskAttemptId,
    num_maps: u32,
    latest_map_id: u32,

    /// Map from partition -> number of records sent to it. Only partitions
    /// that received at least one record appear.
    record_counts: BTreeMap<PartitionId, u64>,

    /// Sequence number of the next record; one per `send_record`.
    next_seq: u64,

    status: UploadStatus,
}

impl UploadSession {
    pub fn new(attempt: AppTaskAttemptId, num_maps: u32, latest_map_id: u32) -> Self {
        UploadSession {
            attempt,
            num_maps,
            latest_map_id,
            record_counts: BTreeMap::new(),
            next_seq: 0,
            status: UploadStatus::Started,
        }
    }

    #[inline]
    pub fn attempt(&self) -> &AppTaskAttemptId {
        &self.attempt
    }

    #[inline]
    pub(crate) fn num_maps(&self) -> u32 {
        self.num_maps
    }

    #[inline]
    pub(crate) fn latest_map_id(&self) -> u32 {
        self.latest_map_id
    }

    #[inline]
    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// Records that one record was sent to `partition`, returning its
    /// sequence number within this upload.
    pub fn record(&mut self, partition: PartitionId) -> u64 {
        *self.record_counts.entry(partition).or_default() += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Partitions written so far, in increasing order.
    pub fn partitions_written(&self) -> Vec<PartitionId> {
        self.record_counts.keys().copied().collect()
    }

    /// Number of records sent to `partition`.
    pub fn records_in(&self, partition: PartitionId) -> u64 {
        self.record_counts.get(&partition).copied().unwrap_or(0)
    }

    /// Total number of records sent in this upload.
    #[inline]
    pub fn total_records(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn mark_finished(&mut self) {
        self.status = UploadStatus::Finished;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status = UploadStatus::Failed;
    }
}
