//! Online Segment Compaction
//!
//! Acks punch holes into segments; the compactor turns the resulting
//! fragmentation back into dense files. Candidates arrive as a *dirty set*
//! of segment numbers whose valid bytes shrank since the last cycle. The
//! pass runs on the coordinator task, so it never races another writer.
//!
//! ## Algorithm
//!
//! 1. **Delete-empty pass** (ascending): a dirty segment with zero valid
//!    bytes is unlinked from the neighbour list and its file deleted. The
//!    current append segment is never touched.
//! 2. **Combine pass**: each survivor `F` tries to merge with a neighbour.
//!    If `valid(left) + valid(F)` fits the segment cap, the left neighbour
//!    absorbs `F`; otherwise, if `valid(F) + valid(right)` fits, `F` absorbs
//!    its right neighbour. Records therefore only ever move leftward in the
//!    segment ordering.
//!
//! ## Combine
//!
//! Absorbing `src` into `dst`:
//!
//! - cached read handles for both files are closed first
//! - if `dst` has holes, its live records above the contiguous prefix are
//!   staged into `<dst>.rdt` (dense, offset order), the staging file is
//!   synced, locations are rewritten, `dst` is truncated to the prefix and
//!   extended to the combined size, and the staged bytes are copied back
//! - `src`'s live records stream onto `dst`'s tail in offset order, with
//!   adjacent records coalesced into single copies
//! - `dst` is fsynced, and only then is `src`'s file deleted
//!
//! Source bytes are never removed before the destination holds the synced
//! combined contents, so a crash at any point leaves either a recoverable
//! `.rdt` or an intact source; recovery sorts out which records count.

use std::collections::BTreeSet;
use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use queuehouse_core::record::FRAME_OVERHEAD;
use queuehouse_core::MsgLocation;

use crate::error::Result;
use crate::location::LocationStore;
use crate::read_cache::ReadHandleCache;
use crate::segment::{read_raw_at, segment_path, temp_path, truncate_and_extend};
use crate::summary::SummaryIndex;

/// Mutable store state the compactor operates on.
pub struct CompactionCtx<'a> {
    pub dir: &'a Path,
    pub cap: u64,
    pub current_segment: u64,
    pub summaries: &'a mut SummaryIndex,
    pub locations: &'a LocationStore,
    pub read_cache: &'a mut ReadHandleCache,
}

/// What one compaction cycle accomplished.
#[derive(Debug, Default)]
pub struct CompactionReport {
    pub segments_deleted: usize,
    pub segments_combined: usize,
    pub bytes_reclaimed: u64,
    /// Dirty segments deferred because they are the current append segment;
    /// the coordinator re-queues them for the next cycle.
    pub skipped: Vec<u64>,
}

/// Run one compaction cycle over the dirty set.
pub async fn run(ctx: &mut CompactionCtx<'_>, dirty: BTreeSet<u64>) -> Result<CompactionReport> {
    let mut report = CompactionReport::default();
    let mut survivors = Vec::new();

    // Pass 1: delete empties, ascending.
    for seg in dirty {
        let Some(sum) = ctx.summaries.get(seg) else {
            continue; // already deleted or absorbed
        };
        if seg == ctx.current_segment {
            report.skipped.push(seg);
            continue;
        }
        if sum.valid_bytes == 0 {
            report.bytes_reclaimed += delete_empty(ctx, seg).await?;
            report.segments_deleted += 1;
        } else {
            survivors.push(seg);
        }
    }

    // Pass 2: combine with a neighbour where the result fits the cap.
    for seg in survivors {
        let Some(sum) = ctx.summaries.get(seg).copied() else {
            continue; // absorbed earlier in this pass
        };

        if let Some(left) = sum.left {
            if left != ctx.current_segment {
                let left_valid = ctx.summaries.get(left).map(|s| s.valid_bytes).unwrap_or(0);
                if left_valid + sum.valid_bytes <= ctx.cap {
                    report.bytes_reclaimed += combine(ctx, seg, left).await?;
                    report.segments_combined += 1;
                    continue;
                }
            }
        }
        if let Some(right) = sum.right {
            if right != ctx.current_segment {
                let right_valid = ctx.summaries.get(right).map(|s| s.valid_bytes).unwrap_or(0);
                if sum.valid_bytes + right_valid <= ctx.cap {
                    report.bytes_reclaimed += combine(ctx, right, seg).await?;
                    report.segments_combined += 1;
                }
            }
        }
    }

    if report.segments_deleted > 0 || report.segments_combined > 0 {
        info!(
            deleted = report.segments_deleted,
            combined = report.segments_combined,
            reclaimed = report.bytes_reclaimed,
            "compaction cycle complete"
        );
    }
    Ok(report)
}

async fn delete_empty(ctx: &mut CompactionCtx<'_>, seg: u64) -> Result<u64> {
    ctx.read_cache.evict(seg);
    let path = segment_path(ctx.dir, seg);
    let len = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    ctx.summaries.unlink_remove(seg);
    fs::remove_file(&path).await?;
    debug!(segment = seg, "empty segment deleted");
    Ok(len)
}

/// Absorb `src` into `dst` (`dst` sits to the left of `src`).
async fn combine(ctx: &mut CompactionCtx<'_>, src: u64, dst: u64) -> Result<u64> {
    ctx.read_cache.evict(src);
    ctx.read_cache.evict(dst);

    let dst_sum = *ctx.summaries.get(dst).expect("combine destination exists");
    let src_sum = *ctx.summaries.get(src).expect("combine source exists");
    let total = dst_sum.valid_bytes + src_sum.valid_bytes;

    let dst_path = segment_path(ctx.dir, dst);
    let src_path = segment_path(ctx.dir, src);

    if dst_sum.contiguous_prefix < dst_sum.valid_bytes {
        squash_holes(ctx, dst, &dst_path, dst_sum.contiguous_prefix, total).await?;
        ctx.summaries.mark_dense(dst);
    }

    // Stream the source's live records onto the destination tail, in offset
    // order, coalescing adjacent records into single block copies.
    let mut src_records = ctx.locations.by_segment(src).await?;
    src_records.sort_by_key(|(_, loc)| loc.offset);

    let mut dst_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&dst_path)
        .await?;
    dst_file
        .seek(std::io::SeekFrom::Start(dst_sum.valid_bytes))
        .await?;
    let mut src_file = fs::File::open(&src_path).await?;

    let mut write_off = dst_sum.valid_bytes;
    let mut i = 0;
    while i < src_records.len() {
        let run_start = src_records[i].1.offset;
        let mut run_end = src_records[i].1.end_offset();
        let mut j = i + 1;
        while j < src_records.len() && src_records[j].1.offset == run_end {
            run_end = src_records[j].1.end_offset();
            j += 1;
        }

        let chunk = read_raw_at(&mut src_file, run_start, run_end - run_start).await?;
        dst_file.write_all(&chunk).await?;

        for (id, loc) in &src_records[i..j] {
            let new_offset = write_off + (loc.offset - run_start);
            ctx.locations
                .insert(
                    *id,
                    MsgLocation {
                        segment: dst,
                        offset: new_offset,
                        ..*loc
                    },
                )
                .await?;
        }

        write_off += run_end - run_start;
        i = j;
    }

    // The source must survive until the destination is durable.
    dst_file.sync_data().await?;
    let reclaimed = fs::metadata(&src_path).await.map(|m| m.len()).unwrap_or(0);
    fs::remove_file(&src_path).await?;

    ctx.summaries.absorb(dst, src, total);
    info!(src, dst, total, "segment absorbed");
    Ok(reclaimed.saturating_sub(src_sum.valid_bytes))
}

/// Rewrite the destination's post-hole records densely via a `.rdt` staging
/// file, then truncate-and-extend to make room for the source.
async fn squash_holes(
    ctx: &mut CompactionCtx<'_>,
    dst: u64,
    dst_path: &Path,
    contig: u64,
    total: u64,
) -> Result<()> {
    let mut records = ctx.locations.by_segment(dst).await?;
    records.retain(|(_, loc)| loc.offset >= contig);
    records.sort_by_key(|(_, loc)| loc.offset);

    let tmp = temp_path(ctx.dir, dst);
    let mut tmp_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .await?;
    let mut dst_read = fs::File::open(dst_path).await?;

    let mut new_off = contig;
    let mut moves = Vec::with_capacity(records.len());
    for (id, loc) in &records {
        let frame = read_raw_at(&mut dst_read, loc.offset, loc.size + FRAME_OVERHEAD).await?;
        tmp_file.write_all(&frame).await?;
        moves.push((*id, *loc, new_off));
        new_off += loc.size + FRAME_OVERHEAD;
    }
    tmp_file.sync_all().await?;
    drop(tmp_file);

    for (id, loc, offset) in &moves {
        ctx.locations
            .insert(
                *id,
                MsgLocation {
                    offset: *offset,
                    ..*loc
                },
            )
            .await?;
    }

    truncate_and_extend(dst_path, contig, total).await?;

    // Copy the staged records back onto the now-dense tail.
    let mut tmp_read = fs::File::open(&tmp).await?;
    let tmp_len = tmp_read.metadata().await?.len();
    let mut dst_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(dst_path)
        .await?;
    dst_file.seek(std::io::SeekFrom::Start(contig)).await?;

    let mut copied = 0u64;
    while copied < tmp_len {
        let chunk_len = (tmp_len - copied).min(1 << 20);
        let chunk = read_raw_at(&mut tmp_read, copied, chunk_len).await?;
        dst_file.write_all(&chunk).await?;
        copied += chunk_len;
    }
    dst_file.sync_data().await?;
    fs::remove_file(&tmp).await?;

    debug!(segment = dst, squashed = moves.len(), "holes squashed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    use queuehouse_core::MessageId;
    use queuehouse_index::QueueIndex;

    use crate::config::StorageMode;
    use crate::segment::{read_record_at, SegmentAppender};

    const CAP: u64 = 4096;

    struct Fixture {
        dir: TempDir,
        summaries: SummaryIndex,
        locations: LocationStore,
        read_cache: ReadHandleCache,
        // Keep the index alive: it owns the SQLite pool.
        _index: QueueIndex,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let index = QueueIndex::open_in_memory().await.unwrap();
            let locations = LocationStore::new(StorageMode::RamDisk, index.pool())
                .await
                .unwrap();
            let read_cache = ReadHandleCache::new(dir.path(), 16);
            Self {
                dir,
                summaries: SummaryIndex::new(),
                locations,
                read_cache,
                _index: index,
            }
        }

        fn ctx(&mut self, current: u64) -> CompactionCtx<'_> {
            CompactionCtx {
                dir: self.dir.path(),
                cap: CAP,
                current_segment: current,
                summaries: &mut self.summaries,
                locations: &self.locations,
                read_cache: &mut self.read_cache,
            }
        }

        /// Write `count` records into a new segment and register them as
        /// live.
        async fn fill_segment(&mut self, seg: u64, count: usize) -> Vec<(MessageId, Bytes)> {
            let mut app = SegmentAppender::create(self.dir.path(), seg, CAP).await.unwrap();
            self.summaries.insert_tail(seg);
            let mut out = Vec::new();
            for i in 0..count {
                let id = MessageId::random();
                let payload = Bytes::from(format!("seg{}-msg{}-payload", seg, i));
                let (offset, size) = app.append(&id, &payload, true).await.unwrap();
                self.summaries.record_append(seg, offset, size + FRAME_OVERHEAD);
                self.locations
                    .insert_new(
                        id,
                        MsgLocation {
                            segment: seg,
                            offset,
                            size,
                            ref_count: 1,
                            persistent: true,
                        },
                    )
                    .await
                    .unwrap();
                out.push((id, payload));
            }
            app.sync().await.unwrap();
            out
        }

        /// Ack (kill) one record: drop its location and mark the hole.
        async fn kill(&mut self, id: &MessageId) {
            let loc = self.locations.delete(id).await.unwrap().unwrap();
            self.summaries
                .record_hole_for(loc.segment, loc.offset, loc.size);
        }

        /// Every live record must be readable at its indexed location.
        async fn assert_all_readable(&mut self, expected: &[(MessageId, Bytes)]) {
            for (id, payload) in expected {
                let loc = self.locations.get(id).await.unwrap().unwrap();
                let handle = self.read_cache.handle(loc.segment).await.unwrap();
                let rec = read_record_at(handle, loc.segment, loc.offset, loc.size)
                    .await
                    .unwrap();
                assert_eq!(&rec.id, id);
                assert_eq!(&rec.payload, payload);
            }
        }
    }

    #[tokio::test]
    async fn test_delete_empty_pass() {
        let mut fx = Fixture::new().await;
        let msgs0 = fx.fill_segment(0, 2).await;
        let msgs1 = fx.fill_segment(1, 2).await;
        let msgs2 = fx.fill_segment(2, 1).await;

        // Empty out segment 1 entirely.
        for (id, _) in &msgs1 {
            fx.kill(id).await;
        }

        let report = run(&mut fx.ctx(2), BTreeSet::from([1])).await.unwrap();
        assert_eq!(report.segments_deleted, 1);
        assert!(!fx.summaries.contains(1));
        assert!(!segment_path(fx.dir.path(), 1).exists());
        assert_eq!(fx.summaries.get(0).unwrap().right, Some(2));
        assert_eq!(fx.summaries.get(2).unwrap().left, Some(0));

        fx.assert_all_readable(&msgs0).await;
        fx.assert_all_readable(&msgs2).await;
    }

    #[tokio::test]
    async fn test_current_segment_is_skipped() {
        let mut fx = Fixture::new().await;
        let msgs = fx.fill_segment(0, 2).await;
        for (id, _) in &msgs {
            fx.kill(id).await;
        }

        let report = run(&mut fx.ctx(0), BTreeSet::from([0])).await.unwrap();
        assert_eq!(report.segments_deleted, 0);
        assert_eq!(report.skipped, vec![0]);
        assert!(fx.summaries.contains(0));
    }

    #[tokio::test]
    async fn test_combine_into_dense_left_neighbour() {
        let mut fx = Fixture::new().await;
        let msgs0 = fx.fill_segment(0, 3).await;
        let mut msgs1 = fx.fill_segment(1, 3).await;
        fx.fill_segment(2, 1).await;

        // A hole in segment 1 makes it dirty; 0 stays dense.
        fx.kill(&msgs1[1].0).await;
        msgs1.remove(1);

        let report = run(&mut fx.ctx(2), BTreeSet::from([1])).await.unwrap();
        assert_eq!(report.segments_combined, 1);

        // Segment 1 was absorbed into 0.
        assert!(!fx.summaries.contains(1));
        assert!(!segment_path(fx.dir.path(), 1).exists());
        let dst = fx.summaries.get(0).unwrap();
        assert_eq!(dst.right, Some(2));
        assert_eq!(dst.valid_bytes, dst.contiguous_prefix);
        assert!(fx.summaries.links_consistent());

        fx.assert_all_readable(&msgs0).await;
        fx.assert_all_readable(&msgs1).await;

        // All survivors point at segment 0 now.
        for (id, _) in &msgs1 {
            assert_eq!(fx.locations.get(id).await.unwrap().unwrap().segment, 0);
        }
    }

    #[tokio::test]
    async fn test_combine_squashes_holey_destination() {
        let mut fx = Fixture::new().await;
        let mut msgs0 = fx.fill_segment(0, 4).await;
        let msgs1 = fx.fill_segment(1, 2).await;
        fx.fill_segment(2, 1).await;

        // Holes in the destination (segment 0) at positions 1 and 2.
        fx.kill(&msgs0[1].0).await;
        fx.kill(&msgs0[2].0).await;
        msgs0.remove(2);
        msgs0.remove(1);
        let sum0_before = *fx.summaries.get(0).unwrap();
        assert!(sum0_before.contiguous_prefix < sum0_before.valid_bytes);

        let report = run(&mut fx.ctx(2), BTreeSet::from([0])).await.unwrap();
        // Segment 0 has no left neighbour; it absorbs its right neighbour.
        assert_eq!(report.segments_combined, 1);
        assert!(!fx.summaries.contains(1));

        let dst = fx.summaries.get(0).unwrap();
        assert_eq!(dst.valid_bytes, dst.contiguous_prefix);

        // Staging file cleaned up.
        assert!(!temp_path(fx.dir.path(), 0).exists());

        fx.assert_all_readable(&msgs0).await;
        fx.assert_all_readable(&msgs1).await;
    }

    #[tokio::test]
    async fn test_combine_respects_cap() {
        let mut fx = Fixture::new().await;

        // Two segments each filled past half the cap cannot combine.
        let mut app = SegmentAppender::create(fx.dir.path(), 0, CAP).await.unwrap();
        fx.summaries.insert_tail(0);
        let big = vec![0u8; (CAP / 2) as usize];
        let id0 = MessageId::random();
        let (off, size) = app.append(&id0, &big, true).await.unwrap();
        fx.summaries.record_append(0, off, size + FRAME_OVERHEAD);
        fx.locations
            .insert_new(id0, MsgLocation { segment: 0, offset: off, size, ref_count: 1, persistent: true })
            .await
            .unwrap();
        app.sync().await.unwrap();

        let mut app = SegmentAppender::create(fx.dir.path(), 1, CAP).await.unwrap();
        fx.summaries.insert_tail(1);
        let id1 = MessageId::random();
        let (off, size) = app.append(&id1, &big, true).await.unwrap();
        fx.summaries.record_append(1, off, size + FRAME_OVERHEAD);
        fx.locations
            .insert_new(id1, MsgLocation { segment: 1, offset: off, size, ref_count: 1, persistent: true })
            .await
            .unwrap();
        app.sync().await.unwrap();

        fx.fill_segment(2, 1).await;

        let report = run(&mut fx.ctx(2), BTreeSet::from([1])).await.unwrap();
        assert_eq!(report.segments_combined, 0);
        assert!(fx.summaries.contains(0));
        assert!(fx.summaries.contains(1));
    }
}
