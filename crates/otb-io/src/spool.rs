//! On-disk overflow spool for the bounded queue
//!
//! An append-only, length-framed, CRC32-per-frame segmented log. Frames hold
//! the post-normalization wire encoding of a record, byte-identical to what
//! the ingest stream sends. Layout on disk:
//!
//! ```text
//! <spill_path>/
//!   lock                  # pid + short process id of the owning instance
//!   recovery.json         # {committed_batch_id, head_segment, head_offset}
//!   segments/seg-<n>.log  # repeating frames: [len:u32 LE][crc32:u32 LE][bytes]
//! ```
//!
//! The read cursor chases the write cursor; the committed head only advances
//! when the ingest manager observes an acknowledgement. On restart the read
//! cursor resumes from the committed head, so unacknowledged frames are
//! re-read and re-sent. Frames failing CRC are discarded and counted, and the
//! remainder of their segment is skipped (frame boundaries cannot be trusted
//! past a bad frame).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use otb_core::{clock, BridgeError};

const FRAME_HEADER_LEN: u64 = 8;
/// Refuse absurd frame lengths so a corrupt header cannot drive a huge read
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Position just past a frame; commits carry the position of the last
/// acknowledged frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolPos {
    pub segment: u64,
    pub end_offset: u64,
}

/// Persisted recovery index
#[derive(Debug, Serialize, Deserialize, Default)]
struct RecoveryIndex {
    committed_batch_id: u64,
    head_segment: u64,
    head_offset: u64,
}

/// Spool occupancy and health facts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpoolStats {
    pub bytes_on_disk: u64,
    pub unread_records: u64,
    pub corrupt_frames: u64,
    pub segments: u64,
}

#[derive(Debug)]
struct SegmentWriter {
    index: u64,
    file: File,
    offset: u64,
}

#[derive(Debug)]
struct ReadCursor {
    segment: u64,
    offset: u64,
    file: Option<(u64, File)>,
}

#[derive(Debug)]
pub struct Spool {
    dir: PathBuf,
    segment_max_bytes: u64,
    max_bytes: u64,
    write: SegmentWriter,
    read: ReadCursor,
    head: SpoolPos,
    committed_batch_id: u64,
    /// Offset past the last CRC-valid frame, for segments found damaged at scan
    valid_end: HashMap<u64, u64>,
    bytes_on_disk: u64,
    unread_records: u64,
    corrupt_frames: u64,
}

impl Spool {
    /// Open (or recover) a spool directory, taking the exclusive lock.
    ///
    /// A second instance on the same path fails with `SpoolLocked`.
    pub fn open(dir: &Path, segment_max_bytes: u64, max_bytes: u64) -> Result<Self, BridgeError> {
        let segments_dir = dir.join("segments");
        fs::create_dir_all(&segments_dir).map_err(io_internal)?;

        let lock_path = dir.join("lock");
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut lock) => {
                let _ = writeln!(lock, "{} {}", std::process::id(), clock::process_id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BridgeError::SpoolLocked(dir.to_path_buf()));
            }
            Err(e) => return Err(io_internal(e)),
        }

        let recovery: RecoveryIndex = fs::read_to_string(dir.join("recovery.json"))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let head = SpoolPos {
            segment: recovery.head_segment,
            end_offset: recovery.head_offset,
        };

        // Enumerate segments; everything before the committed head is garbage.
        let mut indices = list_segments(&segments_dir)?;
        indices.retain(|&n| {
            if n < head.segment {
                let _ = fs::remove_file(segment_path(&segments_dir, n));
                false
            } else {
                true
            }
        });

        let mut spool = Self {
            dir: dir.to_path_buf(),
            segment_max_bytes,
            max_bytes,
            write: SegmentWriter {
                index: head.segment,
                file: open_segment(&segments_dir, head.segment)?,
                offset: 0,
            },
            read: ReadCursor {
                segment: head.segment,
                offset: head.end_offset,
                file: None,
            },
            head,
            committed_batch_id: recovery.committed_batch_id,
            valid_end: HashMap::new(),
            bytes_on_disk: 0,
            unread_records: 0,
            corrupt_frames: 0,
        };
        spool.scan(&indices)?;
        spool.bytes_on_disk = spool.measure_bytes()?;
        Ok(spool)
    }

    /// Walk every surviving segment, verifying CRCs and counting recoverable
    /// frames. The tail segment is truncated past its last valid frame so the
    /// writer can resume; damaged interior segments are fenced via `valid_end`.
    fn scan(&mut self, indices: &[u64]) -> Result<(), BridgeError> {
        let segments_dir = self.segments_dir();
        let tail = indices.iter().copied().max().unwrap_or(self.head.segment);

        for &index in indices {
            let path = segment_path(&segments_dir, index);
            let mut file = File::open(&path).map_err(io_internal)?;
            let len = file.metadata().map_err(io_internal)?.len();
            let mut offset = if index == self.head.segment {
                self.head.end_offset
            } else {
                0
            };
            file.seek(SeekFrom::Start(offset)).map_err(io_internal)?;

            let mut valid = offset;
            loop {
                match read_frame(&mut file, offset, len) {
                    FrameRead::Frame { next_offset, .. } => {
                        self.unread_records += 1;
                        offset = next_offset;
                        valid = next_offset;
                    }
                    FrameRead::End => break,
                    FrameRead::Corrupt => {
                        self.corrupt_frames += 1;
                        tracing::warn!(segment = index, offset, "discarding corrupt spool frames");
                        break;
                    }
                }
            }
            self.valid_end.insert(index, valid);

            if index == tail {
                if valid < len {
                    let file = OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .map_err(io_internal)?;
                    file.set_len(valid).map_err(io_internal)?;
                }
                self.write = SegmentWriter {
                    index,
                    file: open_segment(&segments_dir, index)?,
                    offset: valid,
                };
            }
        }
        Ok(())
    }

    /// Append one encoded record. `SpoolFull` when the byte budget is reached.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        let frame_len = FRAME_HEADER_LEN + bytes.len() as u64;
        if self.bytes_on_disk + frame_len > self.max_bytes {
            return Err(BridgeError::SpoolFull);
        }
        if self.write.offset > 0 && self.write.offset + frame_len > self.segment_max_bytes {
            self.roll()?;
        }

        let crc = crc32fast::hash(bytes);
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        header[4..].copy_from_slice(&crc.to_le_bytes());
        self.write.file.write_all(&header).map_err(io_internal)?;
        self.write.file.write_all(bytes).map_err(io_internal)?;
        self.write.offset += frame_len;
        self.valid_end.insert(self.write.index, self.write.offset);
        self.bytes_on_disk += frame_len;
        self.unread_records += 1;
        Ok(())
    }

    fn roll(&mut self) -> Result<(), BridgeError> {
        self.write.file.flush().map_err(io_internal)?;
        let next = self.write.index + 1;
        self.write = SegmentWriter {
            index: next,
            file: open_segment(&self.segments_dir(), next)?,
            offset: 0,
        };
        self.valid_end.insert(next, 0);
        tracing::debug!(segment = next, "rolled spool segment");
        Ok(())
    }

    /// Next unread frame, advancing the read cursor (not the committed head)
    pub fn read_next(&mut self) -> Result<Option<(Vec<u8>, SpoolPos)>, BridgeError> {
        loop {
            // Past the fence of the current segment: move to the next one,
            // or stop if this is the tail.
            let fence = self
                .valid_end
                .get(&self.read.segment)
                .copied()
                .unwrap_or(self.write.offset);
            if self.read.offset >= fence {
                if self.read.segment >= self.write.index {
                    return Ok(None);
                }
                self.read.segment += 1;
                self.read.offset = 0;
                self.read.file = None;
                continue;
            }

            if self.read.file.as_ref().map(|(n, _)| *n) != Some(self.read.segment) {
                // The writer buffers nothing, but make sure its data hit the OS
                // before reading the same segment back.
                if self.read.segment == self.write.index {
                    self.write.file.flush().map_err(io_internal)?;
                }
                let file =
                    File::open(segment_path(&self.segments_dir(), self.read.segment))
                        .map_err(io_internal)?;
                self.read.file = Some((self.read.segment, file));
            }
            let (_, file) = self.read.file.as_mut().unwrap();
            file.seek(SeekFrom::Start(self.read.offset))
                .map_err(io_internal)?;
            let len = file.metadata().map_err(io_internal)?.len();

            match read_frame(file, self.read.offset, len.min(fence)) {
                FrameRead::Frame { bytes, next_offset } => {
                    self.read.offset = next_offset;
                    self.unread_records = self.unread_records.saturating_sub(1);
                    return Ok(Some((
                        bytes,
                        SpoolPos {
                            segment: self.read.segment,
                            end_offset: next_offset,
                        },
                    )));
                }
                FrameRead::End => {
                    self.read.offset = fence;
                }
                FrameRead::Corrupt => {
                    self.corrupt_frames += 1;
                    self.read.offset = fence;
                }
            }
        }
    }

    /// Advance the committed head past an acknowledged batch and reclaim
    /// fully drained segments.
    pub fn commit(&mut self, batch_id: u64, pos: SpoolPos) -> Result<(), BridgeError> {
        self.head = pos;
        self.committed_batch_id = batch_id;

        let segments_dir = self.segments_dir();
        for index in list_segments(&segments_dir)? {
            if index < pos.segment {
                fs::remove_file(segment_path(&segments_dir, index)).map_err(io_internal)?;
                self.valid_end.remove(&index);
            }
        }

        let recovery = RecoveryIndex {
            committed_batch_id: batch_id,
            head_segment: pos.segment,
            head_offset: pos.end_offset,
        };
        let tmp = self.dir.join("recovery.json.tmp");
        fs::write(&tmp, serde_json::to_vec(&recovery).map_err(|e| io_internal_any(e.into()))?)
            .map_err(io_internal)?;
        fs::rename(&tmp, self.dir.join("recovery.json")).map_err(io_internal)?;
        self.bytes_on_disk = self.measure_bytes()?;
        Ok(())
    }

    fn measure_bytes(&self) -> Result<u64, BridgeError> {
        let segments_dir = self.segments_dir();
        let mut bytes = 0u64;
        for index in list_segments(&segments_dir)? {
            let len = fs::metadata(segment_path(&segments_dir, index))
                .map_err(io_internal)?
                .len();
            bytes += if index == self.head.segment {
                len.saturating_sub(self.head.end_offset)
            } else {
                len
            };
        }
        Ok(bytes)
    }

    pub fn committed_batch_id(&self) -> u64 {
        self.committed_batch_id
    }

    pub fn has_unread(&self) -> bool {
        self.unread_records > 0
    }

    pub fn stats(&self) -> SpoolStats {
        SpoolStats {
            bytes_on_disk: self.bytes_on_disk,
            unread_records: self.unread_records,
            corrupt_frames: self.corrupt_frames,
            segments: self.write.index - self.head.segment + 1,
        }
    }

    /// Release the directory lock. Also runs on drop.
    pub fn unlock(&mut self) {
        let _ = fs::remove_file(self.dir.join("lock"));
    }

    fn segments_dir(&self) -> PathBuf {
        self.dir.join("segments")
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.unlock();
    }
}

enum FrameRead {
    Frame { bytes: Vec<u8>, next_offset: u64 },
    End,
    Corrupt,
}

fn read_frame(file: &mut File, offset: u64, limit: u64) -> FrameRead {
    if offset + FRAME_HEADER_LEN > limit {
        return if offset == limit {
            FrameRead::End
        } else {
            FrameRead::Corrupt
        };
    }
    let mut header = [0u8; 8];
    if file.read_exact(&mut header).is_err() {
        return FrameRead::Corrupt;
    }
    let len = u32::from_le_bytes(header[..4].try_into().unwrap());
    let expected_crc = u32::from_le_bytes(header[4..].try_into().unwrap());
    if len > MAX_FRAME_LEN || offset + FRAME_HEADER_LEN + len as u64 > limit {
        return FrameRead::Corrupt;
    }
    let mut bytes = vec![0u8; len as usize];
    if file.read_exact(&mut bytes).is_err() {
        return FrameRead::Corrupt;
    }
    if crc32fast::hash(&bytes) != expected_crc {
        return FrameRead::Corrupt;
    }
    FrameRead::Frame {
        next_offset: offset + FRAME_HEADER_LEN + len as u64,
        bytes,
    }
}

fn list_segments(segments_dir: &Path) -> Result<Vec<u64>, BridgeError> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(segments_dir).map_err(io_internal)? {
        let entry = entry.map_err(io_internal)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(num) = name
            .strip_prefix("seg-")
            .and_then(|s| s.strip_suffix(".log"))
        {
            if let Ok(n) = num.parse() {
                indices.push(n);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn segment_path(segments_dir: &Path, index: u64) -> PathBuf {
    segments_dir.join(format!("seg-{index}.log"))
}

fn open_segment(segments_dir: &Path, index: u64) -> Result<File, BridgeError> {
    let path = segment_path(segments_dir, index);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(path)
        .map_err(io_internal)?;
    file.seek(SeekFrom::End(0)).map_err(io_internal)?;
    Ok(file)
}

fn io_internal(e: std::io::Error) -> BridgeError {
    BridgeError::Internal(anyhow::Error::new(e).context("spool I/O"))
}

fn io_internal_any(e: anyhow::Error) -> BridgeError {
    BridgeError::Internal(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_small(dir: &Path) -> Spool {
        Spool::open(dir, 256, 64 * 1024).unwrap()
    }

    #[test]
    fn append_read_commit_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut spool = open_small(tmp.path());
        spool.append(b"alpha").unwrap();
        spool.append(b"beta").unwrap();

        let (a, _) = spool.read_next().unwrap().unwrap();
        assert_eq!(a, b"alpha");
        let (b, pos) = spool.read_next().unwrap().unwrap();
        assert_eq!(b, b"beta");
        assert!(spool.read_next().unwrap().is_none());

        spool.commit(1, pos).unwrap();
        assert_eq!(spool.committed_batch_id(), 1);
        assert_eq!(spool.stats().bytes_on_disk, 0);
    }

    #[test]
    fn second_instance_fails_locked() {
        let tmp = TempDir::new().unwrap();
        let _spool = open_small(tmp.path());
        let err = Spool::open(tmp.path(), 256, 64 * 1024).unwrap_err();
        assert!(matches!(err, BridgeError::SpoolLocked(_)));
    }

    #[test]
    fn lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        drop(open_small(tmp.path()));
        let _second = open_small(tmp.path());
    }

    #[test]
    fn segments_roll_and_drain() {
        let tmp = TempDir::new().unwrap();
        let mut spool = open_small(tmp.path());
        // 256-byte segments, 108-byte frames: forces several rolls
        for i in 0..10u8 {
            spool.append(&[i; 100]).unwrap();
        }
        assert!(spool.stats().segments > 1);

        let mut last = None;
        for i in 0..10u8 {
            let (bytes, pos) = spool.read_next().unwrap().unwrap();
            assert_eq!(bytes, vec![i; 100]);
            last = Some(pos);
        }
        spool.commit(7, last.unwrap()).unwrap();
        assert_eq!(spool.stats().segments, 1);
        assert_eq!(spool.stats().bytes_on_disk, 0);
    }

    #[test]
    fn unacked_frames_survive_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let mut spool = open_small(tmp.path());
            for i in 0..5u8 {
                spool.append(&[i; 16]).unwrap();
            }
            // Read and ack the first two only
            spool.read_next().unwrap().unwrap();
            let (_, pos) = spool.read_next().unwrap().unwrap();
            spool.commit(2, pos).unwrap();
        }

        let mut spool = open_small(tmp.path());
        assert_eq!(spool.committed_batch_id(), 2);
        assert_eq!(spool.stats().unread_records, 3);
        for i in 2..5u8 {
            let (bytes, _) = spool.read_next().unwrap().unwrap();
            assert_eq!(bytes, vec![i; 16]);
        }
        assert!(spool.read_next().unwrap().is_none());
        assert_eq!(spool.stats().corrupt_frames, 0);
    }

    #[test]
    fn corrupt_frame_is_discarded_and_counted() {
        let tmp = TempDir::new().unwrap();
        {
            let mut spool = open_small(tmp.path());
            spool.append(b"good-frame").unwrap();
            spool.append(b"bad-frame!").unwrap();
        }
        // Flip a payload byte of the second frame
        let seg = tmp.path().join("segments/seg-0.log");
        let mut bytes = fs::read(&seg).unwrap();
        let second_payload = 8 + 10 + 8;
        bytes[second_payload + 2] ^= 0xff;
        fs::write(&seg, bytes).unwrap();

        let mut spool = open_small(tmp.path());
        assert_eq!(spool.stats().corrupt_frames, 1);
        assert_eq!(spool.stats().unread_records, 1);
        let (ok, _) = spool.read_next().unwrap().unwrap();
        assert_eq!(ok, b"good-frame");
        assert!(spool.read_next().unwrap().is_none());
    }

    #[test]
    fn byte_budget_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let mut spool = Spool::open(tmp.path(), 64, 64).unwrap();
        spool.append(&[0u8; 40]).unwrap();
        let err = spool.append(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, BridgeError::SpoolFull));
    }
}
