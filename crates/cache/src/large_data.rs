//! Large partition/row/cell observation
//!
//! Writers observe the sizes of what they write; observations above the
//! configured thresholds are recorded through a sink (typically a system
//! table). Recording never blocks the write path: observations are handed
//! to a recording worker over a queue with a bounded number in flight, and
//! the write proceeds immediately. Shutdown drains the queue.

use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tessera_core::position::ClusteringPrefix;
use tessera_core::row::ColumnId;
use tessera_core::{DecoratedKey, LargeDataThresholds};

/// Up to this many recordings are in flight at once; later observations
/// queue behind them without blocking the writer.
pub const MAX_CONCURRENT_RECORDINGS: usize = 16;

/// Identity of the sstable an observation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SstableId {
    /// Table the sstable belongs to.
    pub table: String,
    /// Generation number of the sstable.
    pub generation: u64,
}

/// Destination of large-data records.
pub trait LargeDataSink: Send + Sync {
    /// Records a partition above the partition threshold.
    fn record_large_partition(&self, sst: &SstableId, key: &DecoratedKey, size: u64);
    /// Records a row above the row threshold.
    fn record_large_row(
        &self,
        sst: &SstableId,
        key: &DecoratedKey,
        clustering: Option<&ClusteringPrefix>,
        size: u64,
    );
    /// Records a cell above the cell threshold.
    fn record_large_cell(
        &self,
        sst: &SstableId,
        key: &DecoratedKey,
        clustering: Option<&ClusteringPrefix>,
        column: ColumnId,
        size: u64,
    );
    /// Drops every record belonging to a removed sstable.
    fn delete_entries(&self, sst: &SstableId);
}

enum Record {
    Partition(SstableId, DecoratedKey, u64),
    Row(SstableId, DecoratedKey, Option<ClusteringPrefix>, u64),
    Cell(SstableId, DecoratedKey, Option<ClusteringPrefix>, ColumnId, u64),
    Delete(SstableId),
}

/// Asynchronous large-data logger with bounded recording concurrency.
pub struct LargeDataLogger {
    thresholds: LargeDataThresholds,
    tx: Option<Sender<Record>>,
    worker: Option<JoinHandle<()>>,
}

impl LargeDataLogger {
    /// Creates a logger recording through the given sink.
    pub fn new(thresholds: LargeDataThresholds, sink: Arc<dyn LargeDataSink>) -> LargeDataLogger {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("large-data-logger".into())
            .spawn(move || record_loop(rx, sink))
            .expect("spawn large-data worker");
        LargeDataLogger {
            thresholds,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    fn send(&self, record: Record) {
        if let Some(tx) = &self.tx {
            // An unbounded queue never blocks the writer; a closed channel
            // means we are shutting down and the record is dropped.
            let _ = tx.send(record);
        }
    }

    /// Records the partition if it crosses the partition threshold.
    pub fn maybe_record_large_partition(&self, sst: &SstableId, key: &DecoratedKey, size: u64) {
        if size > self.thresholds.partition_bytes {
            self.send(Record::Partition(sst.clone(), key.clone(), size));
        }
    }

    /// Records the row if it crosses the row threshold.
    pub fn maybe_record_large_row(
        &self,
        sst: &SstableId,
        key: &DecoratedKey,
        clustering: Option<&ClusteringPrefix>,
        size: u64,
    ) {
        if size > self.thresholds.row_bytes {
            self.send(Record::Row(
                sst.clone(),
                key.clone(),
                clustering.cloned(),
                size,
            ));
        }
    }

    /// Records the cell if it crosses the cell threshold.
    pub fn maybe_record_large_cell(
        &self,
        sst: &SstableId,
        key: &DecoratedKey,
        clustering: Option<&ClusteringPrefix>,
        column: ColumnId,
        size: u64,
    ) {
        if size > self.thresholds.cell_bytes {
            self.send(Record::Cell(
                sst.clone(),
                key.clone(),
                clustering.cloned(),
                column,
                size,
            ));
        }
    }

    /// Drops every entry of a removed sstable, if its size could have
    /// produced any.
    pub fn maybe_delete_large_data_entries(&self, sst: &SstableId, data_size: u64) {
        let t = &self.thresholds;
        if data_size > t.partition_bytes.min(t.row_bytes).min(t.cell_bytes) {
            self.send(Record::Delete(sst.clone()));
        }
    }

    /// Stops accepting observations and waits until everything queued has
    /// been recorded.
    pub fn stop(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for LargeDataLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_loop(rx: Receiver<Record>, sink: Arc<dyn LargeDataSink>) {
    while let Ok(record) = rx.recv() {
        match record {
            Record::Partition(sst, key, size) => sink.record_large_partition(&sst, &key, size),
            Record::Row(sst, key, ck, size) => {
                sink.record_large_row(&sst, &key, ck.as_ref(), size)
            }
            Record::Cell(sst, key, ck, column, size) => {
                sink.record_large_cell(&sst, &key, ck.as_ref(), column, size)
            }
            Record::Delete(sst) => sink.delete_entries(&sst),
        }
    }
}
