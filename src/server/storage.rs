//! In-memory committed shuffle data, shared by all sessions of a server.

use std::collections::{HashMap, HashSet};

use crate::common::{
    AppShuffleId, AppTaskAttemptId, RecordKeyValuePair, TaskAttemptId,
};
use crate::protocol::PartitionId;
use crate::utils::RssError;

use bytes::Bytes;

use tokio::sync::{watch, Mutex};
use tokio::time::{self, Duration, Instant};

/// A record received within an upload but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    pub partition: PartitionId,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Map from (shuffle, partition) -> committed records in arrival order.
    partitions: HashMap<(AppShuffleId, PartitionId), Vec<RecordKeyValuePair>>,

    /// Map from shuffle -> task attempts that have committed.
    committed: HashMap<AppShuffleId, HashSet<TaskAttemptId>>,
}

/// Committed records of all uploads a server has received. An upload's
/// records become visible to readers atomically when it commits.
#[derive(Debug)]
pub struct ShuffleStore {
    inner: Mutex<StoreInner>,

    /// Bumped on every commit to wake up waiting readers.
    tx_commit: watch::Sender<u64>,
}

impl Default for ShuffleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShuffleStore {
    pub fn new() -> Self {
        let (tx_commit, _) = watch::channel(0);
        ShuffleStore {
            inner: Mutex::new(StoreInner::default()),
            tx_commit,
        }
    }

    /// Commits all staged records of `attempt`, returning how many there
    /// were. Committing the same attempt again replaces its earlier records.
    pub async fn commit(
        &self,
        attempt: &AppTaskAttemptId,
        staged: Vec<StagedRecord>,
    ) -> u64 {
        let shuffle = attempt.app_shuffle_id();
        let num_records = staged.len() as u64;
        {
            let mut inner = self.inner.lock().await;
            let recommit = !inner
                .committed
                .entry(shuffle.clone())
                .or_default()
                .insert(attempt.task_attempt_id);
            if recommit {
                for ((s, _), records) in inner.partitions.iter_mut() {
                    if *s == shuffle {
                        records.retain(|r| {
                            r.task_attempt_id != attempt.task_attempt_id
                        });
                    }
                }
            }

            for record in staged {
                inner
                    .partitions
                    .entry((shuffle.clone(), record.partition))
                    .or_default()
                    .push(RecordKeyValuePair::new(
                        record.key,
                        record.value,
                        attempt.task_attempt_id,
                    ));
            }
        }

        self.tx_commit.send_modify(|n| *n += 1);
        num_records
    }

    /// Whether every one of `attempts` has committed to `shuffle`.
    pub async fn is_committed(
        &self,
        shuffle: &AppShuffleId,
        attempts: &[TaskAttemptId],
    ) -> bool {
        let inner = self.inner.lock().await;
        Self::all_committed(&inner, shuffle, attempts)
    }

    fn all_committed(
        inner: &StoreInner,
        shuffle: &AppShuffleId,
        attempts: &[TaskAttemptId],
    ) -> bool {
        match inner.committed.get(shuffle) {
            Some(done) => attempts.iter().all(|a| done.contains(a)),
            None => attempts.is_empty(),
        }
    }

    /// Returns `partition`'s records written by `attempts` (all committed
    /// attempts if empty), in arrival order. Waits up to `wait` for the
    /// listed attempts to commit first.
    pub async fn read_partition(
        &self,
        shuffle: &AppShuffleId,
        partition: PartitionId,
        attempts: &[TaskAttemptId],
        wait: Duration,
    ) -> Result<Vec<RecordKeyValuePair>, RssError> {
        let deadline = Instant::now() + wait;
        // subscribe before checking so that no commit in between is missed
        let mut rx_commit = self.tx_commit.subscribe();

        loop {
            {
                let inner = self.inner.lock().await;
                if Self::all_committed(&inner, shuffle, attempts) {
                    let records = inner
                        .partitions
                        .get(&(shuffle.clone(), partition))
                        .map(|records| {
                            records
                                .iter()
                                .filter(|r| {
                                    attempts.is_empty()
                                        || attempts.contains(&r.task_attempt_id)
                                })
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    return Ok(records);
                }
            }

            match time::timeout_at(deadline, rx_commit.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(RssError::msg(e)),
                Err(_) => {
                    return Err(RssError::timeout(format!(
                        "attempts {:?} of {} not committed within {} ms",
                        attempts,
                        shuffle,
                        wait.as_millis()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use std::sync::Arc;

    fn staged(partition: PartitionId, value: &'static [u8]) -> StagedRecord {
        StagedRecord {
            partition,
            key: None,
            value: Some(Bytes::from_static(value)),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_then_read() -> Result<(), RssError> {
        let store = ShuffleStore::new();
        let attempt = AppTaskAttemptId::new("app1", "exec1", 1, 2, 5);
        let shuffle = attempt.app_shuffle_id();
        assert!(!store.is_committed(&shuffle, &[5]).await);

        let n = store
            .commit(&attempt, vec![staged(0, b"a"), staged(1, b"b"), staged(0, b"c")])
            .await;
        assert_eq!(n, 3);
        assert!(store.is_committed(&shuffle, &[5]).await);

        let wait = Duration::from_millis(100);
        let records = store.read_partition(&shuffle, 0, &[5], wait).await?;
        assert_eq!(
            records,
            vec![
                RecordKeyValuePair::new(None, Some(Bytes::from_static(b"a")), 5),
                RecordKeyValuePair::new(None, Some(Bytes::from_static(b"c")), 5),
            ]
        );
        assert!(store.read_partition(&shuffle, 9, &[5], wait).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recommit_replaces() -> Result<(), RssError> {
        let store = ShuffleStore::new();
        let attempt = AppTaskAttemptId::new("app1", "exec1", 1, 2, 0);
        let other = AppTaskAttemptId::new("app1", "exec1", 1, 3, 1);
        store.commit(&attempt, vec![staged(0, b"old")]).await;
        store.commit(&other, vec![staged(0, b"other")]).await;
        store.commit(&attempt, vec![staged(0, b"new")]).await;

        let records = store
            .read_partition(&attempt.app_shuffle_id(), 0, &[], Duration::ZERO)
            .await?;
        let values: Vec<_> = records.into_iter().filter_map(|r| r.value).collect();
        assert_eq!(
            values,
            vec![Bytes::from_static(b"other"), Bytes::from_static(b"new")]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_waits_for_commit() -> Result<(), RssError> {
        let store = Arc::new(ShuffleStore::new());
        let attempt = AppTaskAttemptId::new("app1", "exec1", 1, 2, 7);
        let shuffle = attempt.app_shuffle_id();

        let reader = {
            let store = store.clone();
            let shuffle = shuffle.clone();
            tokio::spawn(async move {
                store
                    .read_partition(&shuffle, 4, &[7], Duration::from_secs(5))
                    .await
            })
        };
        time::sleep(Duration::from_millis(50)).await;
        store.commit(&attempt, vec![staged(4, b"late")]).await;
        assert_eq!(reader.await??.len(), 1);

        let missing = store
            .read_partition(&shuffle, 4, &[8], Duration::from_millis(50))
            .await;
        assert!(missing.unwrap_err().is_timeout());
        Ok(())
    }
}
