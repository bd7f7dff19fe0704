//! Store Coordinator
//!
//! The store is a single background task that owns every piece of mutable
//! state: the current append segment, the location index, the segment
//! summaries, the queue sequences, both caches and the dirty set. Public
//! operations are messages on its inboxes, so all externally visible
//! operations are linearised without any fine-grained locking.
//!
//! ## Priority
//!
//! A due group-commit tick runs first, then the control inbox (mode
//! switches, shutdown, operational reports), then the ops inbox (publish,
//! deliver, ack, transactions, queue maintenance): filesync ahead of
//! mode-switching ahead of ordinary traffic. Graceful shutdown drains the
//! ops inbox before the final fsync.
//!
//! ## Group Commit
//!
//! Appends land in the current segment's write buffer and set its dirty
//! flag. A timer fires every `sync_interval_ms`; if the appender is dirty
//! it is fsynced, the last-sync offset advances, and every waiter parked by
//! `tx_commit` gets its reply. A read that would touch unsynced bytes of
//! the current segment forces the fsync early. An fsync failure is
//! propagated to every parked waiter.
//!
//! ## Handle
//!
//! [`MessageStore`] is the cloneable handle. Synchronous operations carry a
//! oneshot reply; asynchronous ones return as soon as the command is
//! enqueued. A reply to a caller that walked away is silently dropped.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use queuehouse_core::record::FRAME_OVERHEAD;
use queuehouse_core::{MessageId, MsgLocation};
use queuehouse_index::{QueueEntry, QueueIndex, RequeueMove};

use crate::compactor::{self, CompactionCtx};
use crate::config::{StorageMode, StoreConfig};
use crate::error::{Result, StoreError};
use crate::location::LocationStore;
use crate::msg_cache::{CacheInfo, MessageCache};
use crate::read_cache::ReadHandleCache;
use crate::recovery;
use crate::segment::{parse_file_name, read_record_at, SegmentAppender};
use crate::sequence::QueueSeqs;
use crate::summary::SummaryIndex;

/// A message handed out by `deliver` / `phantom_deliver`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub msg_id: MessageId,
    pub seq: u64,
    /// Empty for phantom deliveries.
    pub payload: Bytes,
    pub persistent: bool,
    /// The entry had already been handed out before (requeue or crash).
    pub redelivered: bool,
    /// Entries still waiting behind this one.
    pub remaining: u64,
}

/// Per-segment stats reported by `segment_summaries`.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStat {
    pub segment: u64,
    pub valid_bytes: u64,
    pub contiguous_prefix: u64,
}

/// Memory footprint report for the queue-mode manager.
#[derive(Debug, Clone, Copy)]
pub struct MemoryReport {
    pub location_entries: u64,
    pub mode: StorageMode,
    pub message_cache_bytes: u64,
    pub queue_count: u64,
    pub estimated_bytes: u64,
}

enum OpCommand {
    Publish {
        queue: String,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
        delivered: bool,
    },
    Deliver {
        queue: String,
        phantom: bool,
        reply: oneshot::Sender<Result<Option<Delivery>>>,
    },
    Ack {
        queue: String,
        entries: Vec<(MessageId, u64)>,
    },
    TxPublish {
        id: MessageId,
        payload: Bytes,
        persistent: bool,
    },
    TxCommit {
        queue: String,
        publishes: Vec<MessageId>,
        acks: Vec<(MessageId, u64)>,
        reply: oneshot::Sender<Result<()>>,
    },
    TxCancel {
        ids: Vec<MessageId>,
    },
    Requeue {
        queue: String,
        entries: Vec<(MessageId, u64, bool)>,
    },
    RequeueNextN {
        queue: String,
        n: u64,
    },
    Purge {
        queue: String,
        reply: oneshot::Sender<Result<u64>>,
    },
    DeleteQueue {
        queue: String,
    },
    DeclareQueue {
        queue: String,
        durable: bool,
    },
    Length {
        queue: String,
        reply: oneshot::Sender<u64>,
    },
    Entries {
        queue: String,
        reply: oneshot::Sender<Result<Vec<QueueEntry>>>,
    },
    SegmentStats {
        reply: oneshot::Sender<Vec<SegmentStat>>,
    },
    /// Explicit group commit, ordered FIFO with the writes it covers.
    SyncNow {
        reply: oneshot::Sender<Result<()>>,
    },
}

enum ControlCommand {
    SetMode {
        mode: StorageMode,
        reply: oneshot::Sender<Result<()>>,
    },
    ReportMemory {
        reply: oneshot::Sender<MemoryReport>,
    },
    CacheInfo {
        reply: oneshot::Sender<CacheInfo>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    StopAndObliterate {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a running store.
#[derive(Clone)]
pub struct MessageStore {
    control: mpsc::Sender<ControlCommand>,
    ops: mpsc::Sender<OpCommand>,
}

impl MessageStore {
    /// Recover the store from `config.directory` and spawn the coordinator
    /// task. The join handle resolves when the store stops.
    pub async fn start(config: StoreConfig) -> Result<(Self, JoinHandle<()>)> {
        fs::create_dir_all(&config.directory).await?;

        let index = QueueIndex::open(config.directory.join("queue-index.db")).await?;
        let recovered = recovery::recover(&config, &index).await?;

        let locations = LocationStore::new(config.start_mode, index.pool()).await?;
        locations.load(recovered.entries).await?;

        let (control_tx, control_rx) = mpsc::channel(64);
        let (ops_tx, ops_rx) = mpsc::channel(config.op_queue_depth.max(1));

        let read_cache = ReadHandleCache::new(&config.directory, config.read_handle_cache_size);
        let msg_cache = MessageCache::new(config.message_cache_max_bytes);

        let coordinator = Coordinator {
            config,
            index,
            locations,
            summaries: recovered.summaries,
            seqs: recovered.seqs,
            appender: recovered.appender,
            read_cache,
            msg_cache,
            dirty: recovered.dirty,
            pending_sync: Vec::new(),
            control_rx,
            ops_rx,
        };
        let join = tokio::spawn(coordinator.run());

        Ok((
            Self {
                control: control_tx,
                ops: ops_tx,
            },
            join,
        ))
    }

    async fn send_op(&self, cmd: OpCommand) -> Result<()> {
        self.ops.send(cmd).await.map_err(|_| StoreError::Stopped)
    }

    async fn send_control(&self, cmd: ControlCommand) -> Result<()> {
        self.control.send(cmd).await.map_err(|_| StoreError::Stopped)
    }

    /// Append a message and enqueue it on `queue`.
    pub async fn publish(
        &self,
        queue: &str,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
        delivered: bool,
    ) -> Result<()> {
        self.send_op(OpCommand::Publish {
            queue: queue.to_string(),
            id,
            payload,
            persistent,
            delivered,
        })
        .await
    }

    /// Hand out the next entry of `queue`, payload included.
    pub async fn deliver(&self, queue: &str) -> Result<Option<Delivery>> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::Deliver {
            queue: queue.to_string(),
            phantom: false,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Advance the read sequence without reading the payload off disk.
    pub async fn phantom_deliver(&self, queue: &str) -> Result<Option<Delivery>> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::Deliver {
            queue: queue.to_string(),
            phantom: true,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Acknowledge delivered entries: `(msg_id, seq)` pairs.
    pub async fn ack(&self, queue: &str, entries: Vec<(MessageId, u64)>) -> Result<()> {
        self.send_op(OpCommand::Ack {
            queue: queue.to_string(),
            entries,
        })
        .await
    }

    /// Store a message without making it queue-visible yet.
    pub async fn tx_publish(&self, id: MessageId, payload: Bytes, persistent: bool) -> Result<()> {
        self.send_op(OpCommand::TxPublish {
            id,
            payload,
            persistent,
        })
        .await
    }

    /// Atomically enqueue previously `tx_publish`ed messages and apply acks.
    /// The reply arrives only once every published record is durable.
    pub async fn tx_commit(
        &self,
        queue: &str,
        publishes: Vec<MessageId>,
        acks: Vec<(MessageId, u64)>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::TxCommit {
            queue: queue.to_string(),
            publishes,
            acks,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Abandon a set of `tx_publish`ed messages.
    pub async fn tx_cancel(&self, ids: Vec<MessageId>) -> Result<()> {
        self.send_op(OpCommand::TxCancel { ids }).await
    }

    /// Move delivered entries back to the tail, preserving their order:
    /// `(msg_id, seq, delivered)` triples.
    pub async fn requeue(&self, queue: &str, entries: Vec<(MessageId, u64, bool)>) -> Result<()> {
        self.send_op(OpCommand::Requeue {
            queue: queue.to_string(),
            entries,
        })
        .await
    }

    /// Rotate the next `n` undelivered entries to the tail.
    pub async fn requeue_next_n(&self, queue: &str, n: u64) -> Result<()> {
        self.send_op(OpCommand::RequeueNextN {
            queue: queue.to_string(),
            n,
        })
        .await
    }

    /// Drop every entry of `queue`; returns how many were removed.
    pub async fn purge(&self, queue: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::Purge {
            queue: queue.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Purge plus removal of the queue itself.
    pub async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.send_op(OpCommand::DeleteQueue {
            queue: queue.to_string(),
        })
        .await
    }

    /// Register a queue up front; only needed to opt out of durability.
    pub async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        self.send_op(OpCommand::DeclareQueue {
            queue: queue.to_string(),
            durable,
        })
        .await
    }

    /// Logical queue length.
    pub async fn length(&self, queue: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::Length {
            queue: queue.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Stopped)
    }

    /// Fold over a queue's entries in sequence order.
    pub async fn foldl<A, F>(&self, queue: &str, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, QueueEntry) -> A,
    {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::Entries {
            queue: queue.to_string(),
            reply: tx,
        })
        .await?;
        let entries = rx.await.map_err(|_| StoreError::Stopped)??;
        Ok(entries.into_iter().fold(init, |acc, e| f(acc, e)))
    }

    /// Per-segment valid bytes / dense prefix, ascending.
    pub async fn segment_summaries(&self) -> Result<Vec<SegmentStat>> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::SegmentStats { reply: tx }).await?;
        rx.await.map_err(|_| StoreError::Stopped)
    }

    /// Force a group commit covering every operation submitted before it.
    pub async fn sync_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpCommand::SyncNow { reply: tx }).await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Swap the location index to the requested backend.
    pub async fn set_mode(&self, mode: StorageMode) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlCommand::SetMode { mode, reply: tx })
            .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    pub async fn to_disk_only_mode(&self) -> Result<()> {
        self.set_mode(StorageMode::DiskOnly).await
    }

    pub async fn to_ram_disk_mode(&self) -> Result<()> {
        self.set_mode(StorageMode::RamDisk).await
    }

    pub async fn report_memory(&self) -> Result<MemoryReport> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlCommand::ReportMemory { reply: tx })
            .await?;
        rx.await.map_err(|_| StoreError::Stopped)
    }

    pub async fn cache_info(&self) -> Result<CacheInfo> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlCommand::CacheInfo { reply: tx })
            .await?;
        rx.await.map_err(|_| StoreError::Stopped)
    }

    /// Graceful shutdown: final fsync, then the task exits.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlCommand::Stop { reply: tx }).await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Destructive shutdown: delete every segment file and wipe the index.
    pub async fn stop_and_obliterate(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlCommand::StopAndObliterate { reply: tx })
            .await?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }
}

struct Coordinator {
    config: StoreConfig,
    index: QueueIndex,
    locations: LocationStore,
    summaries: SummaryIndex,
    seqs: QueueSeqs,
    appender: SegmentAppender,
    read_cache: ReadHandleCache,
    msg_cache: MessageCache,
    dirty: BTreeSet<u64>,
    pending_sync: Vec<oneshot::Sender<Result<()>>>,
    control_rx: mpsc::Receiver<ControlCommand>,
    ops_rx: mpsc::Receiver<OpCommand>,
}

impl Coordinator {
    async fn run(mut self) {
        // Segments that came back from recovery with holes are compacted
        // before the first command.
        if let Err(err) = self.maybe_compact().await {
            warn!(error = %err, "startup compaction failed");
        }

        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.sync_interval_ms.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut control_open = true;
        let mut ops_open = true;
        loop {
            // Priority: a due group commit, then control traffic, then
            // ordinary operations.
            tokio::select! {
                biased;
                _ = timer.tick() => {
                    if self.appender.dirty() {
                        if let Err(err) = self.sync_current().await {
                            error!(error = %err, "group commit failed");
                        }
                    }
                }
                cmd = self.control_rx.recv(), if control_open => match cmd {
                    Some(cmd) => {
                        if self.handle_control(cmd).await {
                            break;
                        }
                    }
                    None => control_open = false,
                },
                cmd = self.ops_rx.recv(), if ops_open => match cmd {
                    Some(cmd) => self.handle_op(cmd).await,
                    None => ops_open = false,
                },
            }
            if !control_open && !ops_open {
                break;
            }
        }
        debug!("coordinator stopped");
    }

    /// Returns `true` when the coordinator should exit.
    async fn handle_control(&mut self, cmd: ControlCommand) -> bool {
        match cmd {
            ControlCommand::SetMode { mode, reply } => {
                let result = self.locations.set_mode(mode).await.map(|_| ());
                let _ = reply.send(result);
                false
            }
            ControlCommand::ReportMemory { reply } => {
                let _ = reply.send(self.memory_report().await);
                false
            }
            ControlCommand::CacheInfo { reply } => {
                let _ = reply.send(self.msg_cache.info());
                false
            }
            ControlCommand::Stop { reply } => {
                // Graceful: everything already submitted is applied and
                // made durable before the task exits.
                self.drain_ops().await;
                let result = if self.appender.dirty() {
                    self.sync_current().await
                } else {
                    Ok(())
                };
                info!("store stopping");
                let _ = reply.send(result);
                true
            }
            ControlCommand::StopAndObliterate { reply } => {
                let result = self.obliterate().await;
                info!("store obliterated");
                let _ = reply.send(result);
                true
            }
        }
    }

    async fn handle_op(&mut self, cmd: OpCommand) {
        match cmd {
            OpCommand::Publish {
                queue,
                id,
                payload,
                persistent,
                delivered,
            } => {
                if let Err(err) = self.publish(&queue, id, payload, persistent, delivered).await {
                    error!(queue = %queue, %id, error = %err, "publish failed");
                }
            }
            OpCommand::Deliver { queue, phantom, reply } => {
                let _ = reply.send(self.deliver(&queue, !phantom).await);
            }
            OpCommand::Ack { queue, entries } => {
                if let Err(err) = self.ack(&queue, &entries).await {
                    error!(queue = %queue, error = %err, "ack failed");
                }
            }
            OpCommand::TxPublish { id, payload, persistent } => {
                if let Err(err) = self.store_message(id, &payload, persistent).await {
                    error!(%id, error = %err, "tx_publish failed");
                }
            }
            OpCommand::TxCommit {
                queue,
                publishes,
                acks,
                reply,
            } => {
                match self.tx_commit(&queue, &publishes, &acks).await {
                    Ok(true) => self.pending_sync.push(reply),
                    Ok(false) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            OpCommand::TxCancel { ids } => {
                if let Err(err) = self.tx_cancel(&ids).await {
                    error!(error = %err, "tx_cancel failed");
                }
            }
            OpCommand::Requeue { queue, entries } => {
                if let Err(err) = self.requeue(&queue, &entries).await {
                    error!(queue = %queue, error = %err, "requeue failed");
                }
            }
            OpCommand::RequeueNextN { queue, n } => {
                if let Err(err) = self.requeue_next_n(&queue, n).await {
                    error!(queue = %queue, n, error = %err, "requeue_next_n failed");
                }
            }
            OpCommand::Purge { queue, reply } => {
                let _ = reply.send(self.purge(&queue).await);
            }
            OpCommand::DeleteQueue { queue } => {
                if let Err(err) = self.delete_queue(&queue).await {
                    error!(queue = %queue, error = %err, "delete_queue failed");
                }
            }
            OpCommand::DeclareQueue { queue, durable } => {
                if let Err(err) = self.declare(&queue, durable).await {
                    error!(queue = %queue, error = %err, "declare_queue failed");
                }
            }
            OpCommand::Length { queue, reply } => {
                let _ = reply.send(self.seqs.length(&queue));
            }
            OpCommand::Entries { queue, reply } => {
                let _ = reply.send(self.index.entries(&queue).await.map_err(Into::into));
            }
            OpCommand::SegmentStats { reply } => {
                let stats = self
                    .summaries
                    .iter()
                    .map(|(segment, sum)| SegmentStat {
                        segment,
                        valid_bytes: sum.valid_bytes,
                        contiguous_prefix: sum.contiguous_prefix,
                    })
                    .collect();
                let _ = reply.send(stats);
            }
            OpCommand::SyncNow { reply } => {
                let result = if self.appender.dirty() {
                    self.sync_current().await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Apply everything still queued on the ops inbox (graceful shutdown).
    async fn drain_ops(&mut self) {
        while let Ok(cmd) = self.ops_rx.try_recv() {
            self.handle_op(cmd).await;
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    async fn declare(&mut self, queue: &str, durable: bool) -> Result<()> {
        self.index.declare_queue(queue, durable).await?;
        self.seqs.declare(queue);
        Ok(())
    }

    /// Queues come into existence on first publish, durable by default.
    async fn ensure_queue(&mut self, queue: &str) -> Result<()> {
        if !self.seqs.contains(queue) {
            self.declare(queue, true).await?;
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        queue: &str,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
        delivered: bool,
    ) -> Result<()> {
        self.ensure_queue(queue).await?;
        self.store_message(id, &payload, persistent).await?;

        let seq = self.seqs.write_seq(queue);
        self.index.insert_entry(queue, seq, &id, delivered).await?;
        self.seqs.bump_write(queue, 1);
        Ok(())
    }

    /// Write the payload once; re-publishing a known id only bumps its
    /// reference count.
    async fn store_message(
        &mut self,
        id: MessageId,
        payload: &Bytes,
        persistent: bool,
    ) -> Result<()> {
        match self.locations.get(&id).await? {
            Some(mut loc) => {
                loc.ref_count += 1;
                self.locations.insert(id, loc).await?;
                // Referenced more than once: it will be delivered again
                // soon, so keep the payload hot.
                self.msg_cache.share(id, payload.clone(), loc.ref_count);
            }
            None => {
                self.roll_if_full().await?;
                let segment = self.appender.segment();
                let (offset, size) = self.appender.append(&id, payload, persistent).await?;
                self.summaries
                    .record_append(segment, offset, size + FRAME_OVERHEAD);
                self.locations
                    .insert_new(
                        id,
                        MsgLocation {
                            segment,
                            offset,
                            size,
                            ref_count: 1,
                            persistent,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn roll_if_full(&mut self) -> Result<()> {
        if self.appender.offset() < self.config.segment_max_size {
            return Ok(());
        }
        // The filled segment keeps its write buffer until synced; flush it
        // before the handle goes away.
        if self.appender.dirty() {
            self.sync_current().await?;
        }
        let next = self.appender.segment() + 1;
        self.appender = SegmentAppender::create(
            &self.config.directory,
            next,
            self.config.segment_max_size,
        )
        .await?;
        self.summaries.insert_tail(next);
        info!(segment = next, "segment rolled");
        Ok(())
    }

    async fn sync_current(&mut self) -> Result<()> {
        match self.appender.sync().await {
            Ok(offset) => {
                debug!(segment = self.appender.segment(), offset, "segment synced");
                for waiter in self.pending_sync.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                let msg = err.to_string();
                for waiter in self.pending_sync.drain(..) {
                    let _ = waiter.send(Err(StoreError::Sync(msg.clone())));
                }
                Err(StoreError::Sync(msg))
            }
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    async fn deliver(&mut self, queue: &str, with_payload: bool) -> Result<Option<Delivery>> {
        // Acks of undelivered entries leave gaps inside the sequence range;
        // they are skipped here and closed for good at the next startup.
        let (entry, read_seq, write_seq) = loop {
            let (read_seq, write_seq) = self.seqs.bounds(queue);
            if read_seq == write_seq {
                return Ok(None);
            }
            match self.index.read_entry(queue, read_seq).await? {
                Some(entry) => break (entry, read_seq, write_seq),
                None => self.seqs.advance_read(queue, 1),
            }
        };
        let loc = self
            .locations
            .get(&entry.msg_id)
            .await?
            .ok_or(StoreError::UnknownMessage(entry.msg_id))?;

        if !entry.delivered {
            self.index.mark_delivered(queue, read_seq).await?;
        }

        let payload = if with_payload {
            self.read_payload(&entry.msg_id, &loc).await?
        } else {
            // The caller already holds the payload; still consume the
            // cached copy's expected fetch. A miss is fine.
            let _ = self.msg_cache.fetch(&entry.msg_id);
            Bytes::new()
        };

        self.seqs.advance_read(queue, 1);
        Ok(Some(Delivery {
            msg_id: entry.msg_id,
            seq: read_seq,
            payload,
            persistent: loc.persistent,
            redelivered: entry.delivered,
            remaining: write_seq - read_seq - 1,
        }))
    }

    async fn read_payload(&mut self, id: &MessageId, loc: &MsgLocation) -> Result<Bytes> {
        if let Some(payload) = self.msg_cache.fetch(id) {
            return Ok(payload);
        }

        // Reading unsynced bytes of the current segment through a separate
        // descriptor requires the write buffer flushed first.
        if loc.segment == self.appender.segment()
            && self.appender.dirty()
            && loc.end_offset() > self.appender.last_sync()
        {
            self.sync_current().await?;
        }

        let handle = self.read_cache.handle(loc.segment).await?;
        let rec = read_record_at(handle, loc.segment, loc.offset, loc.size).await?;
        if rec.id != *id {
            return Err(StoreError::CorruptSegment {
                segment: loc.segment,
                offset: loc.offset,
                reason: format!("expected {}, found {}", id, rec.id),
            });
        }

        // Shared messages get cached for their remaining deliveries.
        if loc.ref_count > 1 {
            self.msg_cache
                .insert(*id, rec.payload.clone(), loc.ref_count - 1)?;
        }
        Ok(rec.payload)
    }

    // ------------------------------------------------------------------
    // Reference management
    // ------------------------------------------------------------------

    /// Drop one reference; the last one kills the message and opens a hole.
    async fn release(&mut self, id: &MessageId) -> Result<()> {
        let Some(mut loc) = self.locations.get(id).await? else {
            warn!(%id, "release for unknown message ignored");
            return Ok(());
        };
        if loc.ref_count > 1 {
            loc.ref_count -= 1;
            self.locations.insert(*id, loc).await?;
        } else {
            self.locations.delete(id).await?;
            self.msg_cache.remove(id);
            self.summaries
                .record_hole_for(loc.segment, loc.offset, loc.size);
            self.dirty.insert(loc.segment);
        }
        Ok(())
    }

    async fn ack(&mut self, queue: &str, entries: &[(MessageId, u64)]) -> Result<()> {
        for (id, seq) in entries {
            let existed = self.index.delete_entry(queue, *seq).await?;
            if !existed {
                warn!(queue, seq = *seq, "ack for missing queue row");
            }
            self.release(id).await?;
        }
        self.maybe_compact().await
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Returns `Ok(true)` when the reply must wait for the next fsync.
    async fn tx_commit(
        &mut self,
        queue: &str,
        publishes: &[MessageId],
        acks: &[(MessageId, u64)],
    ) -> Result<bool> {
        self.ensure_queue(queue).await?;

        let base = self.seqs.write_seq(queue);
        let mut rows = Vec::with_capacity(publishes.len());
        let mut defer = false;
        for (i, id) in publishes.iter().enumerate() {
            let loc = self
                .locations
                .get(id)
                .await?
                .ok_or(StoreError::UnknownMessage(*id))?;
            if loc.segment == self.appender.segment()
                && self.appender.dirty()
                && loc.end_offset() > self.appender.last_sync()
            {
                defer = true;
            }
            rows.push((*id, base + i as u64, false));
        }

        let ack_seqs: Vec<u64> = acks.iter().map(|(_, seq)| *seq).collect();
        self.index.tx_commit(queue, &rows, &ack_seqs).await?;
        self.seqs.bump_write(queue, publishes.len() as u64);

        for (id, _) in acks {
            self.release(id).await?;
        }
        self.maybe_compact().await?;

        Ok(defer)
    }

    async fn tx_cancel(&mut self, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            self.release(id).await?;
        }
        self.maybe_compact().await
    }

    // ------------------------------------------------------------------
    // Queue maintenance
    // ------------------------------------------------------------------

    async fn requeue(&mut self, queue: &str, entries: &[(MessageId, u64, bool)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let base = self.seqs.write_seq(queue);
        let moves: Vec<RequeueMove> = entries
            .iter()
            .enumerate()
            .map(|(i, (_, seq, delivered))| RequeueMove {
                old_seq: *seq,
                new_seq: base + i as u64,
                delivered: Some(*delivered),
            })
            .collect();
        self.index.requeue(queue, &moves).await?;
        self.seqs.bump_write(queue, entries.len() as u64);
        Ok(())
    }

    async fn requeue_next_n(&mut self, queue: &str, n: u64) -> Result<()> {
        let (read_seq, write_seq) = self.seqs.bounds(queue);
        let n = n.min(write_seq - read_seq);
        if n == 0 {
            return Ok(());
        }
        let moves: Vec<RequeueMove> = (0..n)
            .map(|i| RequeueMove {
                old_seq: read_seq + i,
                new_seq: write_seq + i,
                delivered: None,
            })
            .collect();
        self.index.requeue(queue, &moves).await?;
        self.seqs.advance_read(queue, n);
        self.seqs.bump_write(queue, n);
        Ok(())
    }

    async fn purge(&mut self, queue: &str) -> Result<u64> {
        let ids = self.index.purge(queue).await?;
        let count = ids.len() as u64;
        for id in &ids {
            self.release(id).await?;
        }
        self.seqs.purge(queue);
        self.maybe_compact().await?;
        info!(queue, count, "queue purged");
        Ok(count)
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<()> {
        let ids = self.index.delete_queue(queue).await?;
        for id in &ids {
            self.release(id).await?;
        }
        self.seqs.remove(queue);
        self.maybe_compact().await?;
        info!(queue, "queue deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compaction / shutdown
    // ------------------------------------------------------------------

    async fn maybe_compact(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut self.dirty);
        let current_segment = self.appender.segment();
        let mut ctx = CompactionCtx {
            dir: self.config.directory.as_path(),
            cap: self.config.segment_max_size,
            current_segment,
            summaries: &mut self.summaries,
            locations: &self.locations,
            read_cache: &mut self.read_cache,
        };
        let report = compactor::run(&mut ctx, dirty).await?;
        // The current append segment cannot be compacted; retry after it
        // rolls.
        for seg in report.skipped {
            self.dirty.insert(seg);
        }
        Ok(())
    }

    async fn memory_report(&self) -> MemoryReport {
        let location_entries = self.locations.len().await.unwrap_or(0);
        let cache = self.msg_cache.info();
        // Rough per-entry footprint of the in-memory backend; disk mode
        // reports only the cache.
        let entry_bytes = match self.locations.mode() {
            StorageMode::RamDisk => location_entries * 64,
            StorageMode::DiskOnly => 0,
        };
        MemoryReport {
            location_entries,
            mode: self.locations.mode(),
            message_cache_bytes: cache.bytes,
            queue_count: self.seqs.queue_count() as u64,
            estimated_bytes: entry_bytes + cache.bytes,
        }
    }

    async fn obliterate(&mut self) -> Result<()> {
        self.read_cache.clear();
        self.msg_cache.clear();

        let mut reader = fs::read_dir(&self.config.directory).await?;
        while let Some(entry) = reader.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if parse_file_name(name).is_some() {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        self.index.obliterate().await?;
        Ok(())
    }
}
