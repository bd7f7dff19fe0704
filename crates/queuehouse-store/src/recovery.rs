//! Startup Recovery
//!
//! The store may have died at any instant: mid-append, mid-fsync, or in the
//! middle of a compaction combine. Recovery rebuilds every in-memory index
//! from the two durable artifacts — segment files and the queue-entry table
//! — resolving every ambiguity by discarding the suspect message, never by
//! fabricating state.
//!
//! ## Protocol
//!
//! 1. Enumerate `.rdq` segment files and `.rdt` staging files.
//! 2. Classify each staging file against its segment. Only one case needs
//!    replay: the staging file holds records the segment lost to a
//!    truncate. Then the segment is cut back to its dense prefix and the
//!    staged bytes appended. Every other case just deletes the staging
//!    file.
//! 3. Drop non-durable queues wholesale, then derive per-message reference
//!    counts from the surviving rows.
//! 4. Scan every segment. Transient records are dropped outright; records
//!    without a queue row are dead and skipped; a record seen in an earlier
//!    segment is a leftover copy from an interrupted combine and the
//!    earlier (destination) copy wins.
//! 5. Rebuild summaries: valid bytes and the dense prefix over live records
//!    only; neighbour links in ascending segment order.
//! 6. Delete queue rows whose message did not survive, then rebuild each
//!    queue's `(read_seq, write_seq)` and close sequence gaps.
//! 7. Reopen the highest segment for append at the end of its raw dense
//!    run (or create segment 0 in an empty directory).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

use queuehouse_core::record::FRAME_OVERHEAD;
use queuehouse_core::{MessageId, MsgLocation};
use queuehouse_index::QueueIndex;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::segment::{
    contiguous_end, parse_file_name, scan, segment_path, temp_path, SegmentAppender,
};
use crate::sequence::QueueSeqs;
use crate::summary::SummaryIndex;

/// Everything the coordinator needs to resume from disk.
pub struct RecoveredStore {
    pub entries: Vec<(MessageId, MsgLocation)>,
    pub summaries: SummaryIndex,
    pub seqs: QueueSeqs,
    pub appender: SegmentAppender,
    /// Segments that already carry holes and are worth a compaction cycle.
    pub dirty: BTreeSet<u64>,
}

pub async fn recover(config: &StoreConfig, index: &QueueIndex) -> Result<RecoveredStore> {
    let dir = config.directory.as_path();

    // 1. Enumerate the directory.
    let mut segments: BTreeSet<u64> = BTreeSet::new();
    let mut temps: BTreeSet<u64> = BTreeSet::new();
    let mut reader = fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if let Some((seg, is_temp)) = parse_file_name(name) {
                if is_temp {
                    temps.insert(seg);
                } else {
                    segments.insert(seg);
                }
            }
        }
    }

    // 2. Resolve staging files left by an interrupted combine.
    for seg in &temps {
        resolve_temp(dir, *seg, segments.contains(seg)).await?;
    }

    // 3. Non-durable queues do not survive a restart; drop them before
    // reference counts are derived so counts only cover durable rows.
    let dropped = index.drop_transient_queues().await?;
    if !dropped.is_empty() {
        info!(count = dropped.len(), "transient queues dropped");
    }
    let refcounts: HashMap<MessageId, u64> = index.refcounts().await?.into_iter().collect();

    // 4. Scan segments, keeping the first copy of every referenced message.
    let mut entries = Vec::new();
    let mut live_ids: HashSet<MessageId> = HashSet::new();
    let mut summaries = SummaryIndex::new();
    let mut dirty = BTreeSet::new();
    let mut raw_ends: BTreeMap<u64, u64> = BTreeMap::new();

    for seg in &segments {
        let records = scan(&segment_path(dir, *seg)).await?;
        raw_ends.insert(*seg, contiguous_end(&records));

        let mut live = Vec::new();
        let mut raw_bytes = 0u64;
        for rec in records {
            raw_bytes += rec.size + FRAME_OVERHEAD;
            if !rec.persistent {
                // Transient messages carry no durability guarantee; their
                // rows are swept below.
                continue;
            }
            if live_ids.contains(&rec.id) {
                // Leftover source copy from an interrupted combine.
                continue;
            }
            let Some(&ref_count) = refcounts.get(&rec.id) else {
                continue; // dead: no queue row references it
            };
            live_ids.insert(rec.id);
            entries.push((
                rec.id,
                MsgLocation {
                    segment: *seg,
                    offset: rec.offset,
                    size: rec.size,
                    ref_count,
                    persistent: rec.persistent,
                },
            ));
            live.push(rec);
        }

        let valid: u64 = live.iter().map(|r| r.size + FRAME_OVERHEAD).sum();
        summaries.insert_unlinked(*seg, valid, contiguous_end(&live));
        if valid < raw_bytes {
            dirty.insert(*seg);
        }
    }
    summaries.relink();

    // 6. Sweep rows whose message is gone, then rebuild dense sequences.
    let swept = index.sweep_dead_entries(&live_ids).await?;
    if swept > 0 {
        info!(rows = swept, "dead queue rows swept");
    }

    let mut seqs = QueueSeqs::new();
    for (queue, _durable) in index.queue_names().await? {
        match index.compact_gaps(&queue).await? {
            Some((read_seq, write_seq)) => seqs.set(&queue, read_seq, write_seq),
            None => seqs.set(&queue, 0, 0),
        }
    }

    // 7. Reopen the log tail for append.
    let appender = match segments.iter().next_back() {
        Some(&tail) => {
            let append_at = raw_ends.get(&tail).copied().unwrap_or(0);
            SegmentAppender::open_at(dir, tail, append_at, config.segment_max_size).await?
        }
        None => {
            summaries.insert_tail(0);
            SegmentAppender::create(dir, 0, config.segment_max_size).await?
        }
    };

    info!(
        segments = summaries.len(),
        messages = entries.len(),
        queues = seqs.queue_count(),
        append_segment = appender.segment(),
        append_offset = appender.offset(),
        "store recovered"
    );

    Ok(RecoveredStore {
        entries,
        summaries,
        seqs,
        appender,
        dirty,
    })
}

/// Classify one staging file. Replay is needed only when the staging file
/// holds records its segment no longer has (the combine truncated the
/// segment and died before copying the staged bytes back).
async fn resolve_temp(dir: &std::path::Path, seg: u64, has_segment: bool) -> Result<()> {
    let tmp = temp_path(dir, seg);
    if !has_segment {
        warn!(segment = seg, "orphan staging file removed");
        fs::remove_file(&tmp).await?;
        return Ok(());
    }

    let main = segment_path(dir, seg);
    let main_records = scan(&main).await?;
    let tmp_records = scan(&tmp).await?;

    let main_ids: HashSet<MessageId> = main_records.iter().map(|r| r.id).collect();
    let missing = tmp_records.iter().any(|r| !main_ids.contains(&r.id));

    if missing {
        let cut = contiguous_end(&main_records);
        let staged = contiguous_end(&tmp_records);
        replay_temp(&main, &tmp, cut, staged).await?;
        info!(
            segment = seg,
            cut,
            staged,
            "staging file replayed onto truncated segment"
        );
    }
    fs::remove_file(&tmp).await?;
    Ok(())
}

/// Cut the segment back to its dense prefix and append the staged records.
async fn replay_temp(
    main: &std::path::Path,
    tmp: &std::path::Path,
    cut: u64,
    staged: u64,
) -> Result<()> {
    let staged_bytes = fs::read(tmp).await?;
    let staged_bytes = &staged_bytes[..staged as usize];

    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(main)
        .await?;
    file.set_len(cut).await?;
    file.seek(std::io::SeekFrom::Start(cut)).await?;
    file.write_all(staged_bytes).await?;
    file.sync_all().await?;
    Ok(())
}
