//! Segment File I/O
//!
//! Segments are the append-only files of the message log, named by a
//! monotonically increasing integer with a `.rdq` extension; the compactor's
//! staging files use `.rdt`. All record bytes follow the framing defined in
//! `queuehouse_core::record`.
//!
//! ## Append Path
//!
//! [`SegmentAppender`] owns the current segment's write handle behind a
//! `BufWriter`. Appends land in the write buffer; durability is a separate
//! explicit [`SegmentAppender::sync`] (flush + `sync_data`), driven by the
//! coordinator's group-commit timer. On creation the file is preallocated to
//! the segment cap and the write position reset to zero, so the file grows
//! once instead of fragmenting.
//!
//! ## Read Path
//!
//! [`read_record_at`] seeks a read handle to an absolute offset, reads
//! exactly `size + 17` bytes and verifies the framing. Any mismatch means
//! the segment is corrupt at that location.
//!
//! ## Recovery Scan
//!
//! [`scan`] walks a segment from the front. A zero length prefix, an
//! unexpected id size or an unknown terminator means the position does not
//! hold a record (preallocated tail, torn write): the scanner skips
//! `total_size + 17` bytes and keeps going, mirroring the error policy that
//! suspect data is discarded, never repaired.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use queuehouse_core::record::{self, FRAME_OVERHEAD, MESSAGE_ID_LEN};
use queuehouse_core::{DecodedRecord, MessageId};

use crate::error::{Result, StoreError};

/// Extension for live segment files.
pub const SEGMENT_EXTENSION: &str = "rdq";

/// Extension for compaction staging files.
pub const TEMP_EXTENSION: &str = "rdt";

pub fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{}.{}", segment, SEGMENT_EXTENSION))
}

pub fn temp_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{}.{}", segment, TEMP_EXTENSION))
}

/// Parse a directory entry name into `(segment, is_temp)`.
pub fn parse_file_name(name: &str) -> Option<(u64, bool)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let segment: u64 = stem.parse().ok()?;
    match ext {
        SEGMENT_EXTENSION => Some((segment, false)),
        TEMP_EXTENSION => Some((segment, true)),
        _ => None,
    }
}

/// A record found by the recovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    pub id: MessageId,
    pub persistent: bool,
    /// Body size, excluding framing.
    pub size: u64,
    pub offset: u64,
}

/// Byte length of the leading dense run of `records` (ascending offset
/// order): the largest prefix with no holes.
pub fn contiguous_end(records: &[ScannedRecord]) -> u64 {
    let mut end = 0u64;
    for rec in records {
        if rec.offset == end {
            end += rec.size + FRAME_OVERHEAD;
        } else {
            break;
        }
    }
    end
}

/// Write handle for the current append segment.
pub struct SegmentAppender {
    segment: u64,
    writer: BufWriter<File>,
    offset: u64,
    last_sync: u64,
    dirty: bool,
}

impl SegmentAppender {
    /// Create a fresh segment, preallocated to `cap`, positioned at zero.
    pub async fn create(dir: &Path, segment: u64, cap: u64) -> Result<Self> {
        let path = segment_path(dir, segment);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        file.set_len(cap).await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;

        debug!(segment, cap, "segment created");
        Ok(Self {
            segment,
            writer: BufWriter::new(file),
            offset: 0,
            last_sync: 0,
            dirty: false,
        })
    }

    /// Reopen an existing segment for append at `offset` (recovery).
    ///
    /// Everything below `offset` is already on disk, so the last-sync mark
    /// starts there.
    pub async fn open_at(dir: &Path, segment: u64, offset: u64, cap: u64) -> Result<Self> {
        let path = segment_path(dir, segment);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();
        if len < cap {
            file.set_len(cap).await?;
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        debug!(segment, offset, "segment reopened for append");
        Ok(Self {
            segment,
            writer: BufWriter::new(file),
            offset,
            last_sync: offset,
            dirty: false,
        })
    }

    /// Append one record. Returns `(offset, size)` where `size` excludes the
    /// 17 framing bytes.
    pub async fn append(
        &mut self,
        id: &MessageId,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(u64, u64)> {
        let frame = record::encode(id, payload, persistent);
        let at = self.offset;
        self.writer.write_all(&frame).await?;
        self.offset += frame.len() as u64;
        self.dirty = true;
        Ok((at, record::body_len(payload.len() as u64)))
    }

    /// Flush the write buffer and fsync. Returns the new last-sync offset.
    pub async fn sync(&mut self) -> Result<u64> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        self.last_sync = self.offset;
        self.dirty = false;
        Ok(self.last_sync)
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn last_sync(&self) -> u64 {
        self.last_sync
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }
}

/// Read and verify one record frame at an absolute offset.
pub async fn read_record_at(
    file: &mut File,
    segment: u64,
    offset: u64,
    size: u64,
) -> Result<DecodedRecord> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut frame = vec![0u8; (size + FRAME_OVERHEAD) as usize];
    file.read_exact(&mut frame).await?;
    record::decode(&frame).map_err(|err| StoreError::CorruptSegment {
        segment,
        offset,
        reason: err.to_string(),
    })
}

/// Read `len` raw frame bytes at an absolute offset (compaction copies).
pub async fn read_raw_at(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn skip_bytes(reader: &mut BufReader<File>, mut n: u64) -> Result<()> {
    let mut scratch = [0u8; 8192];
    while n > 0 {
        let chunk = n.min(scratch.len() as u64) as usize;
        reader.read_exact(&mut scratch[..chunk]).await?;
        n -= chunk as u64;
    }
    Ok(())
}

/// Sequential forward scan for well-framed records.
///
/// Returns records in ascending offset order. Positions that do not hold a
/// complete valid record are skipped by `total_size + 17`; a frame that
/// cannot fit in the remaining file ends the scan.
pub async fn scan(path: &Path) -> Result<Vec<ScannedRecord>> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let mut reader = BufReader::with_capacity(1 << 20, file);

    let mut records = Vec::new();
    let mut pos = 0u64;
    let mut header = [0u8; 16];

    while pos + FRAME_OVERHEAD <= len {
        reader.read_exact(&mut header).await?;
        let (total, id_size) = record::read_prefixes(&header);
        let remaining = len - pos - 16;

        if total == 0 || id_size == 0 || id_size != MESSAGE_ID_LEN || id_size > total {
            let skip = (total + 1).min(remaining);
            skip_bytes(&mut reader, skip).await?;
            pos += 16 + skip;
            continue;
        }
        if total + 1 > remaining {
            // Torn frame at the end of the file.
            break;
        }

        let frame_len = (16 + total + 1) as usize;
        let mut frame = vec![0u8; frame_len];
        frame[..16].copy_from_slice(&header);
        reader.read_exact(&mut frame[16..]).await?;

        if let Ok(rec) = record::decode(&frame) {
            records.push(ScannedRecord {
                id: rec.id,
                persistent: rec.persistent,
                size: rec.total_size,
                offset: pos,
            });
        }
        pos += 16 + total + 1;
    }

    Ok(records)
}

/// Compaction primitive: set the file to `low` bytes, extend it back out to
/// `high`, leaving zeroes between.
pub async fn truncate_and_extend(path: &Path, low: u64, high: u64) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path).await?;
    file.set_len(low).await?;
    file.set_len(high).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CAP: u64 = 8192;

    async fn appender(dir: &TempDir) -> SegmentAppender {
        SegmentAppender::create(dir.path(), 0, CAP).await.unwrap()
    }

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(parse_file_name("0.rdq"), Some((0, false)));
        assert_eq!(parse_file_name("42.rdq"), Some((42, false)));
        assert_eq!(parse_file_name("7.rdt"), Some((7, true)));
        assert_eq!(parse_file_name("index.db"), None);
        assert_eq!(parse_file_name("abc.rdq"), None);
        assert_eq!(parse_file_name("rdq"), None);
    }

    #[tokio::test]
    async fn test_create_preallocates_to_cap() {
        let dir = TempDir::new().unwrap();
        let _app = appender(&dir).await;
        let len = std::fs::metadata(segment_path(dir.path(), 0)).unwrap().len();
        assert_eq!(len, CAP);
    }

    #[tokio::test]
    async fn test_append_sync_scan_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;

        let ids: Vec<_> = (0..3).map(|_| MessageId::random()).collect();
        let mut offsets = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let payload = format!("payload-{}", i);
            let (offset, size) = app.append(id, payload.as_bytes(), true).await.unwrap();
            assert_eq!(size, 16 + payload.len() as u64);
            offsets.push(offset);
        }
        app.sync().await.unwrap();

        let records = scan(&segment_path(dir.path(), 0)).await.unwrap();
        assert_eq!(records.len(), 3);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.id, ids[i]);
            assert_eq!(rec.offset, offsets[i]);
            assert!(rec.persistent);
        }
        // Dense from the start of the file.
        assert_eq!(contiguous_end(&records), app.offset());
    }

    #[tokio::test]
    async fn test_read_record_at() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        let id = MessageId::random();
        let (offset, size) = app.append(&id, b"hello store", false).await.unwrap();
        app.sync().await.unwrap();

        let mut file = File::open(segment_path(dir.path(), 0)).await.unwrap();
        let rec = read_record_at(&mut file, 0, offset, size).await.unwrap();
        assert_eq!(rec.id, id);
        assert_eq!(&rec.payload[..], b"hello store");
        assert!(!rec.persistent);
    }

    #[tokio::test]
    async fn test_read_record_at_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        let id = MessageId::random();
        let (offset, size) = app.append(&id, b"payload", true).await.unwrap();
        app.sync().await.unwrap();

        // Flip the terminator byte.
        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let term_at = (offset + size + FRAME_OVERHEAD - 1) as usize;
        bytes[term_at] = 0x00;
        std::fs::write(&path, &bytes).unwrap();

        let mut file = File::open(&path).await.unwrap();
        let err = read_record_at(&mut file, 0, offset, size).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptSegment { .. }));
    }

    #[tokio::test]
    async fn test_scan_skips_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        let ids: Vec<_> = (0..3).map(|_| MessageId::random()).collect();
        let mut frames = Vec::new();
        for id in &ids {
            frames.push(app.append(id, b"x", true).await.unwrap());
        }
        app.sync().await.unwrap();

        // Corrupt the middle record's terminator.
        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let (mid_offset, mid_size) = frames[1];
        bytes[(mid_offset + mid_size + FRAME_OVERHEAD - 1) as usize] = 0x13;
        std::fs::write(&path, &bytes).unwrap();

        let records = scan(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, ids[0]);
        assert_eq!(records[1].id, ids[2]);
        // The hole breaks the dense run after the first record.
        assert_eq!(contiguous_end(&records), frames[1].0);
    }

    #[tokio::test]
    async fn test_scan_ignores_preallocated_tail() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        app.append(&MessageId::random(), b"only", true).await.unwrap();
        app.sync().await.unwrap();

        // File is CAP long; everything after the record is zeroes.
        let records = scan(&segment_path(dir.path(), 0)).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_stops_at_torn_tail_frame() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), 0);

        // A record frame chopped mid-payload.
        let frame = record::encode(&MessageId::random(), &[0xAA; 64], true);
        std::fs::write(&path, &frame[..frame.len() - 10]).unwrap();

        let records = scan(&path).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_truncate_and_extend() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        app.append(&MessageId::random(), b"abc", true).await.unwrap();
        app.sync().await.unwrap();

        let path = segment_path(dir.path(), 0);
        truncate_and_extend(&path, 10, 100).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_open_at_resumes_append() {
        let dir = TempDir::new().unwrap();
        let first_end;
        let id_a = MessageId::random();
        let id_b = MessageId::random();
        {
            let mut app = appender(&dir).await;
            app.append(&id_a, b"first", true).await.unwrap();
            app.sync().await.unwrap();
            first_end = app.offset();
        }

        let mut app = SegmentAppender::open_at(dir.path(), 0, first_end, CAP)
            .await
            .unwrap();
        assert_eq!(app.last_sync(), first_end);
        app.append(&id_b, b"second", true).await.unwrap();
        app.sync().await.unwrap();

        let records = scan(&segment_path(dir.path(), 0)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, id_a);
        assert_eq!(records[1].id, id_b);
        assert_eq!(records[1].offset, first_end);
    }

    #[tokio::test]
    async fn test_dirty_tracking() {
        let dir = TempDir::new().unwrap();
        let mut app = appender(&dir).await;
        assert!(!app.dirty());

        app.append(&MessageId::random(), b"x", true).await.unwrap();
        assert!(app.dirty());
        assert_eq!(app.last_sync(), 0);

        let synced = app.sync().await.unwrap();
        assert!(!app.dirty());
        assert_eq!(synced, app.offset());
    }
}
