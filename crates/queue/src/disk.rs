//! Disk-backed queue: a segmented append-only log with crash recovery
//! (§4.4). Segments live under a configured directory named
//! `<persist-name>-<segment-seq>.qf`; a small sidecar file
//! `<persist-name>.head` carries the fsynced count of acked records
//! (the "head marker"), so replay on reopen starts past everything
//! already acknowledged, never past anything still outstanding.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use event::Event;
use parking_lot::Mutex;
use tracing::warn;

use crate::frame::{self, FrameType};
use crate::{PersistentQueue, QueueError};

struct Segment {
    seq: u64,
    path: PathBuf,
    /// Number of records the segment held at last write, used to know
    /// when the whole segment has been acked and can be unlinked.
    record_count: usize,
}

struct DiskQueueState {
    segments: VecDeque<Segment>,
    write_file: File,
    write_seq: u64,
    write_size: u64,
    /// Records pushed but not yet handed out by `pop`.
    unpopped: VecDeque<Event>,
    /// Records handed out by `pop` but not yet acked.
    in_flight: VecDeque<Event>,
    /// Records acked so far, durable head marker.
    acked: u64,
}

/// A crash-recoverable, disk-backed event queue.
pub struct DiskQueue {
    dir: PathBuf,
    persist_name: String,
    segment_capacity_bytes: u64,
    /// Combined unpopped + in-flight record count at which `is_full`
    /// starts signalling back pressure, mirroring `MemoryQueue`'s
    /// `max_events`.
    high_water_records: usize,
    state: Mutex<DiskQueueState>,
}

fn head_path(dir: &Path, persist_name: &str) -> PathBuf {
    dir.join(format!("{persist_name}.head"))
}

fn segment_path(dir: &Path, persist_name: &str, seq: u64) -> PathBuf {
    dir.join(format!("{persist_name}-{seq}.qf"))
}

fn read_head_marker(dir: &Path, persist_name: &str) -> u64 {
    match fs::read(head_path(dir, persist_name)) {
        Ok(bytes) if bytes.len() == 8 => {
            u64::from_le_bytes(bytes.try_into().expect("checked len"))
        }
        _ => 0,
    }
}

fn write_head_marker(dir: &Path, persist_name: &str, value: u64) -> std::io::Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(head_path(dir, persist_name))?;
    f.write_all(&value.to_le_bytes())?;
    f.sync_all()
}

fn existing_segment_seqs(dir: &Path, persist_name: &str) -> std::io::Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let prefix = format!("{persist_name}-");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Some(seq_str) = rest.strip_suffix(".qf") {
                if let Ok(seq) = seq_str.parse::<u64>() {
                    seqs.push(seq);
                }
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

impl DiskQueue {
    /// Opens (creating if necessary) a disk queue under `dir` keyed by
    /// `persist_name`. Replays existing segments, validating frames and
    /// truncating the last segment to its last good frame on checksum
    /// failure, then rebuilds the in-memory index of unacked records
    /// starting at the persisted head marker.
    pub fn open(
        dir: impl Into<PathBuf>,
        persist_name: impl Into<String>,
        segment_capacity_bytes: u64,
        high_water_records: usize,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        let persist_name = persist_name.into();
        fs::create_dir_all(&dir)?;

        let head = read_head_marker(&dir, &persist_name);
        let seqs = existing_segment_seqs(&dir, &persist_name)?;

        let mut segments = VecDeque::new();
        let mut unpopped = VecDeque::new();
        let mut record_index: u64 = 0;

        for seq in &seqs {
            let path = segment_path(&dir, &persist_name, *seq);
            let mut file = File::open(&path)?;
            let mut raw = Vec::new();
            file.read_to_end(&mut raw)?;
            let mut buf = Bytes::from(raw);
            let mut count_in_segment = 0usize;
            let mut good_len = 0usize;
            loop {
                let before = buf.len();
                match frame::decode(&mut buf) {
                    Ok(Some(decoded)) => {
                        good_len += before - buf.len();
                        count_in_segment += 1;
                        record_index += 1;
                        if record_index > head {
                            if decoded.frame_type == FrameType::Event as u8 {
                                if let Ok(ev) = Event::parse(decoded.body) {
                                    unpopped.push_back(ev);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            segment = %path.display(),
                            "corrupt frame in segment, truncating to last good frame"
                        );
                        break;
                    }
                }
            }
            if good_len < file.metadata()?.len() as usize {
                // Truncate the file on disk to the last good frame so a
                // subsequent append starts from a clean boundary.
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(good_len as u64)?;
            }
            segments.push_back(Segment {
                seq: *seq,
                path,
                record_count: count_in_segment,
            });
        }

        let write_seq = segments.back().map(|s| s.seq).unwrap_or(0);
        let write_path = segment_path(&dir, &persist_name, write_seq);
        let write_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&write_path)?;
        let write_size = write_file.metadata()?.len();
        if segments.is_empty() {
            segments.push_back(Segment {
                seq: write_seq,
                path: write_path,
                record_count: 0,
            });
        }

        Ok(Self {
            dir,
            persist_name,
            segment_capacity_bytes,
            high_water_records,
            state: Mutex::new(DiskQueueState {
                segments,
                write_file,
                write_seq,
                write_size,
                unpopped,
                in_flight: VecDeque::new(),
                acked: head,
            }),
        })
    }

    fn roll_segment(&self, state: &mut DiskQueueState) -> std::io::Result<()> {
        state.write_seq += 1;
        let path = segment_path(&self.dir, &self.persist_name, state.write_seq);
        state.write_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        state.write_size = 0;
        state.segments.push_back(Segment {
            seq: state.write_seq,
            path,
            record_count: 0,
        });
        Ok(())
    }
}

impl PersistentQueue for DiskQueue {
    fn push(&self, event: Event) -> Result<(), QueueError> {
        let body = event.marshal();
        let frame = frame::encode(FrameType::Event, &body);

        let mut state = self.state.lock();
        if state.write_size + frame.len() as u64 > self.segment_capacity_bytes
            && state.write_size > 0
        {
            self.roll_segment(&mut state).map_err(QueueError::Io)?;
        }
        state.write_file.write_all(&frame).map_err(QueueError::Io)?;
        state.write_file.sync_data().map_err(QueueError::Io)?;
        state.write_size += frame.len() as u64;
        if let Some(seg) = state.segments.back_mut() {
            seg.record_count += 1;
        }
        state.unpopped.push_back(event);
        Ok(())
    }

    fn push_front(&self, event: Event) -> Result<(), QueueError> {
        // Requeued events are already durable (they were popped from
        // this same log, not newly appended), so this only restores the
        // in-memory ordering; the on-disk frames and head marker are
        // untouched. Callers requeuing a failed batch call this once per
        // event in reverse pop order, so popping `in_flight`'s tail here
        // retires exactly the entry each call is restoring.
        let mut state = self.state.lock();
        let _ = state.in_flight.pop_back();
        state.unpopped.push_front(event);
        Ok(())
    }

    fn pop(&self) -> Option<Event> {
        let mut state = self.state.lock();
        let event = state.unpopped.pop_front()?;
        state.in_flight.push_back(event.ref_());
        Some(event)
    }

    fn ack(&self, count: usize) {
        let mut state = self.state.lock();
        let mut acked_in_call = 0usize;
        for _ in 0..count {
            if state.in_flight.pop_front().is_none() {
                break;
            }
            acked_in_call += 1;
        }
        state.acked += acked_in_call as u64;
        let acked = state.acked;
        if let Err(err) = write_head_marker(&self.dir, &self.persist_name, acked) {
            warn!(error = %err, "failed to fsync disk queue head marker");
        }

        // Unlink segments that are now entirely behind the head marker.
        let mut consumed: u64 = 0;
        while let Some(seg) = state.segments.front() {
            let seg_end = consumed + seg.record_count as u64;
            if seg_end <= acked && state.segments.len() > 1 {
                let seg = state.segments.pop_front().expect("checked front");
                if let Err(err) = fs::remove_file(&seg.path) {
                    warn!(segment = %seg.path.display(), error = %err, "failed to unlink acked segment");
                }
                consumed = seg_end;
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state.unpopped.len() + state.in_flight.len()
    }

    fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.unpopped.len() + state.in_flight.len() >= self.high_water_records
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use event::EventMeta;

    fn push_n(q: &DiskQueue, n: u64) {
        for i in 0..n {
            let mut ev = Event::new(EventMeta::default());
            ev.set("i", event::Value::Int64(i as i64)).unwrap();
            q.push(ev).unwrap();
        }
    }

    #[test]
    fn crash_recovery_replays_only_unacked_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = DiskQueue::open(dir.path(), "d1", 1 << 20, 1000).unwrap();
            push_n(&q, 10);
            for _ in 0..2 {
                let _ = q.pop().unwrap();
            }
            q.ack(2);
            // Simulate a crash: drop without any further graceful shutdown.
        }
        let reopened = DiskQueue::open(dir.path(), "d1", 1 << 20, 1000).unwrap();
        assert_eq!(reopened.len(), 8);
        for i in 2..10 {
            let ev = reopened.pop().unwrap();
            assert_eq!(ev.get("i"), Some(&event::Value::Int64(i)));
        }
    }

    #[test]
    fn corrupt_tail_frame_truncates_segment_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = DiskQueue::open(dir.path(), "d2", 1 << 20, 1000).unwrap();
            push_n(&q, 3);
        }
        // Corrupt the last byte (part of the final frame's CRC).
        let seqs = existing_segment_seqs(dir.path(), "d2").unwrap();
        let path = segment_path(dir.path(), "d2", *seqs.last().unwrap());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let reopened = DiskQueue::open(dir.path(), "d2", 1 << 20, 1000).unwrap();
        // The corrupt final frame is dropped; the earlier two survive.
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn ack_unlinks_fully_acked_segments() {
        let dir = tempfile::tempdir().unwrap();
        let q = DiskQueue::open(dir.path(), "d3", 64, 1000).unwrap();
        push_n(&q, 20);
        for _ in 0..20 {
            let _ = q.pop();
        }
        q.ack(20);
        let seqs = existing_segment_seqs(dir.path(), "d3").unwrap();
        // Only the still-open write segment should remain.
        assert_eq!(seqs.len(), 1);
    }
}
