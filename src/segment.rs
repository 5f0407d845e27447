//! Append-only segment store
//!
//! Committed mutation batches are persisted as framed records in immutable
//! segment files. A segment is sealed once it outgrows the size threshold or
//! the flush interval elapses with unflushed frames, whichever comes first.
//!
//! ## Segment File Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Segment Header (44 bytes)                                  │
//! ├────────────────────────────────────────────────────────────┤
//! │ magic: u32          = 0x4D454F4E ("NOEM")                  │
//! │ version: u16        = 1                                    │
//! │ sealed: u16         = 0 (active tail) | 1 (immutable)      │
//! │ segment_id: u64                                            │
//! │ seq_lo: u64         = lowest sequence number contained     │
//! │ seq_hi: u64         = highest sequence number contained    │
//! │ frame_count: u32                                           │
//! │ checksum: u64       = SHA-256/64 over all frame payloads   │
//! ├────────────────────────────────────────────────────────────┤
//! │ Frames (repeated)                                          │
//! │   payload_len: u32                                         │
//! │   checksum: u64     = SHA-256/64 over this payload         │
//! │   payload           = bincode Vec<SequencedMutation>       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Recovery trusts per-frame checksums for the unsealed tail (good prefix is
//! kept, the rest truncated) and the whole-payload checksum for sealed
//! segments (a mismatch marks the segment corrupt; its sequence range is
//! reported as lost and startup proceeds).

use crate::error::{NoemaError, Result};
use crate::types::SequencedMutation;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// "NOEM" in little-endian
const SEGMENT_MAGIC: u32 = 0x4D454F4E;

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 44;

/// Frame prefix: payload_len (u32) + checksum (u64)
const FRAME_PREFIX: usize = 12;

/// First 8 bytes of SHA-256, as a big-endian u64
fn checksum64(payload: &[u8]) -> u64 {
    let digest = Sha256::digest(payload);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

fn checksum64_from_hasher(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Parsed segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentHeader {
    segment_id: u64,
    sealed: bool,
    seq_lo: u64,
    seq_hi: u64,
    frame_count: u32,
    checksum: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(self.sealed as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq_lo.to_le_bytes());
        buf[24..32].copy_from_slice(&self.seq_hi.to_le_bytes());
        buf[32..36].copy_from_slice(&self.frame_count.to_le_bytes());
        buf[36..44].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if magic != SEGMENT_MAGIC || version != SEGMENT_VERSION {
            return None;
        }
        Some(Self {
            sealed: u16::from_le_bytes(buf[6..8].try_into().unwrap()) == 1,
            segment_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            seq_lo: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            seq_hi: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            frame_count: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            checksum: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
        })
    }
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("segment-{:016x}.seg", segment_id))
}

/// State of the segment currently accepting frames
struct ActiveSegment {
    file: File,
    segment_id: u64,
    seq_lo: u64,
    seq_hi: u64,
    frame_count: u32,
    payload_hasher: Sha256,
    bytes_written: u64,
    dirty_since: Option<Instant>,
}

/// Owner of the segment directory. Single-writer: all mutation happens on
/// the segment-writer task; reads happen single-threaded during recovery.
pub struct SegmentStore {
    dir: PathBuf,
    active: Option<ActiveSegment>,
    next_segment_id: u64,
}

impl SegmentStore {
    /// Open (creating if needed) a segment directory for appending, starting
    /// new segments after `next_segment_id - 1`
    pub fn open(dir: impl Into<PathBuf>, next_segment_id: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            active: None,
            next_segment_id,
        })
    }

    /// Append one committed batch as a frame of the active segment
    pub fn append_batch(&mut self, batch: &[SequencedMutation]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let payload = bincode::serialize(batch)?;
        let seq_lo = batch.first().map(|m| m.sequence).unwrap_or(0);
        let seq_hi = batch.last().map(|m| m.sequence).unwrap_or(0);

        if self.active.is_none() {
            self.active = Some(self.open_tail()?);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(NoemaError::Other("segment tail unavailable".to_string()));
        };

        let mut frame = Vec::with_capacity(FRAME_PREFIX + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum64(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        active.file.write_all(&frame)?;
        active.file.flush()?;

        active.payload_hasher.update(&payload);
        active.seq_lo = active.seq_lo.min(seq_lo);
        active.seq_hi = active.seq_hi.max(seq_hi);
        active.frame_count += 1;
        active.bytes_written += frame.len() as u64;
        active.dirty_since.get_or_insert_with(Instant::now);

        Ok(())
    }

    fn open_tail(&mut self) -> Result<ActiveSegment> {
        let segment_id = self.next_segment_id;
        self.next_segment_id += 1;
        let path = segment_path(&self.dir, segment_id);
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;

        let header = SegmentHeader {
            segment_id,
            sealed: false,
            seq_lo: 0,
            seq_hi: 0,
            frame_count: 0,
            checksum: 0,
        };
        file.write_all(&header.encode())?;
        debug!(segment_id, path = %path.display(), "opened segment tail");

        Ok(ActiveSegment {
            file,
            segment_id,
            seq_lo: u64::MAX,
            seq_hi: 0,
            frame_count: 0,
            payload_hasher: Sha256::new(),
            bytes_written: HEADER_SIZE as u64,
            dirty_since: None,
        })
    }

    /// True if the active segment should be sealed now
    pub fn should_seal(&self, size_threshold: u64, flush_interval_ms: u64) -> bool {
        match &self.active {
            Some(active) => {
                active.bytes_written >= size_threshold
                    || active
                        .dirty_since
                        .map(|since| since.elapsed().as_millis() as u64 >= flush_interval_ms)
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    /// Seal the active segment: finalize the header, fsync, and retire it.
    /// Returns the sealed segment id, or None if there was nothing to seal.
    pub fn seal_active(&mut self) -> Result<Option<u64>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };

        let ActiveSegment {
            mut file,
            segment_id,
            seq_lo,
            seq_hi,
            frame_count,
            payload_hasher,
            ..
        } = active;

        let header = SegmentHeader {
            segment_id,
            sealed: true,
            seq_lo,
            seq_hi,
            frame_count,
            checksum: checksum64_from_hasher(payload_hasher),
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        info!(segment_id, seq_lo, seq_hi, frame_count, "sealed segment");
        Ok(Some(segment_id))
    }

    /// Make queued frames durable without sealing
    pub fn sync(&mut self) -> Result<()> {
        if let Some(active) = self.active.as_mut() {
            active.file.sync_all()?;
        }
        Ok(())
    }
}

/// Outcome of startup recovery
#[derive(Debug, Default)]
pub struct Recovery {
    /// All recovered mutations, sorted by sequence number
    pub mutations: Vec<SequencedMutation>,

    /// Segments skipped because of checksum or format failures
    pub corrupt: Vec<NoemaError>,

    /// Highest sequence number recovered (0 if none)
    pub max_sequence: u64,

    /// First segment id not yet used
    pub next_segment_id: u64,
}

/// Replay the segment directory.
///
/// Sealed segments failing their whole-payload checksum are skipped and
/// reported with the sequence range they covered; the unsealed tail keeps
/// its good frame prefix and truncates at the first bad frame. Recovery never
/// refuses to start over bounded, reported loss.
pub fn recover(dir: &Path) -> Result<Recovery> {
    let mut recovery = Recovery::default();
    if !dir.exists() {
        return Ok(recovery);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map(|ext| ext == "seg").unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        match read_segment(&path) {
            Ok((header, mutations)) => {
                recovery.next_segment_id = recovery.next_segment_id.max(header.segment_id + 1);
                recovery.mutations.extend(mutations);
            }
            Err(report) => {
                warn!(path = %path.display(), %report, "skipping unreadable segment");
                if let NoemaError::SegmentCorruption { segment_id, .. } = report {
                    recovery.next_segment_id = recovery.next_segment_id.max(segment_id + 1);
                }
                recovery.corrupt.push(report);
            }
        }
    }

    recovery.mutations.sort_unstable_by_key(|m| m.sequence);
    recovery.mutations.dedup_by_key(|m| m.sequence);
    recovery.max_sequence = recovery.mutations.last().map(|m| m.sequence).unwrap_or(0);

    info!(
        mutations = recovery.mutations.len(),
        corrupt_segments = recovery.corrupt.len(),
        max_sequence = recovery.max_sequence,
        "segment recovery complete"
    );
    Ok(recovery)
}

/// Read one segment file, validating checksums per its sealed state
fn read_segment(path: &Path) -> std::result::Result<(SegmentHeader, Vec<SequencedMutation>), NoemaError> {
    let mut file = File::open(path).map_err(NoemaError::Io)?;
    let mut header_buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_buf).map_err(|_| {
        NoemaError::SegmentCorruption {
            segment_id: segment_id_from_path(path),
            lo: 0,
            hi: 0,
        }
    })?;

    let header = SegmentHeader::decode(&header_buf).ok_or(NoemaError::SegmentCorruption {
        segment_id: segment_id_from_path(path),
        lo: 0,
        hi: 0,
    })?;

    let mut mutations = Vec::new();
    let mut payload_hasher = Sha256::new();
    let mut frames_read = 0u32;
    let mut tail_truncated = false;

    loop {
        let mut prefix = [0u8; FRAME_PREFIX];
        match file.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(_) => break, // clean EOF or a torn frame prefix
        }
        let payload_len = u32::from_le_bytes(prefix[0..4].try_into().unwrap()) as usize;
        let frame_checksum = u64::from_le_bytes(prefix[4..12].try_into().unwrap());

        let mut payload = vec![0u8; payload_len];
        if file.read_exact(&mut payload).is_err() {
            tail_truncated = true;
            break;
        }
        if checksum64(&payload) != frame_checksum {
            tail_truncated = true;
            break;
        }

        let batch: Vec<SequencedMutation> = match bincode::deserialize(&payload) {
            Ok(batch) => batch,
            Err(_) => {
                tail_truncated = true;
                break;
            }
        };

        payload_hasher.update(&payload);
        frames_read += 1;
        mutations.extend(batch);
    }

    if header.sealed {
        // A sealed segment is all-or-nothing: any frame damage, a short frame
        // count, or a cumulative checksum mismatch loses the whole range.
        if tail_truncated
            || frames_read != header.frame_count
            || checksum64_from_hasher(payload_hasher) != header.checksum
        {
            return Err(NoemaError::SegmentCorruption {
                segment_id: header.segment_id,
                lo: header.seq_lo,
                hi: header.seq_hi,
            });
        }
    } else if tail_truncated {
        warn!(
            segment_id = header.segment_id,
            frames_kept = frames_read,
            "unsealed tail truncated at first bad frame"
        );
    }

    Ok((header, mutations))
}

fn segment_id_from_path(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("segment-"))
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

/// Commands handled by the segment-writer task. `Persist` and `Seal` share
/// one channel so a seal always covers every batch sent before it.
pub(crate) enum SegmentCommand {
    /// Append a committed batch to the active segment
    Persist(Vec<SequencedMutation>),

    /// Seal the active segment and acknowledge durability
    Seal { ack: oneshot::Sender<Result<()>> },
}

/// Handle controlling the background segment-writer task
pub(crate) struct SegmentWriterHandle {
    command_tx: mpsc::UnboundedSender<SegmentCommand>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SegmentWriterHandle {
    /// Spawn the writer task over an opened store
    pub(crate) fn spawn(
        store: SegmentStore,
        size_threshold: u64,
        flush_interval_ms: u64,
        sealed_segments: Arc<AtomicU64>,
        io_failed: Arc<AtomicBool>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_writer_loop(
            store,
            size_threshold,
            flush_interval_ms,
            command_rx,
            shutdown_rx,
            sealed_segments,
            io_failed,
        ));

        Self {
            command_tx,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<SegmentCommand> {
        self.command_tx.clone()
    }

    /// Seal the active segment and wait for the fsync
    pub(crate) async fn seal(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(SegmentCommand::Seal { ack })
            .map_err(|_| NoemaError::ShuttingDown)?;
        done.await.map_err(|_| NoemaError::ShuttingDown)?
    }

    /// Stop the writer task gracefully, sealing any remaining tail
    pub(crate) async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| NoemaError::Other(format!("segment writer task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for SegmentWriterHandle {
    fn drop(&mut self) {
        // Dropped without `stop`: hard-stop, like a killed process
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_writer_loop(
    mut store: SegmentStore,
    size_threshold: u64,
    flush_interval_ms: u64,
    mut command_rx: mpsc::UnboundedReceiver<SegmentCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
    sealed_segments: Arc<AtomicU64>,
    io_failed: Arc<AtomicBool>,
) {
    let mut flush_timer =
        tokio::time::interval(std::time::Duration::from_millis(flush_interval_ms.max(1)));
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(SegmentCommand::Persist(batch)) => {
                        if io_failed.load(Ordering::Acquire) {
                            error!(
                                batch_len = batch.len(),
                                "segment store unavailable, dropping batch (reads unaffected)"
                            );
                            continue;
                        }
                        if let Err(e) = store.append_batch(&batch) {
                            error!(error = %e, "segment append failed, latching fatal I/O state");
                            io_failed.store(true, Ordering::Release);
                            continue;
                        }
                        if store.should_seal(size_threshold, flush_interval_ms) {
                            let _ = seal(&mut store, &sealed_segments, &io_failed);
                        }
                    }
                    Some(SegmentCommand::Seal { ack }) => {
                        let result = if io_failed.load(Ordering::Acquire) {
                            Err(NoemaError::FatalIo(
                                "segment store latched after I/O failure".to_string(),
                            ))
                        } else {
                            seal(&mut store, &sealed_segments, &io_failed)
                        };
                        let _ = ack.send(result);
                    }
                    None => break,
                }
            }

            _ = flush_timer.tick() => {
                if !io_failed.load(Ordering::Acquire)
                    && store.should_seal(size_threshold, flush_interval_ms)
                {
                    let _ = seal(&mut store, &sealed_segments, &io_failed);
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("segment writer received shutdown signal");
                // Drain whatever the reconciler already handed off
                while let Ok(command) = command_rx.try_recv() {
                    match command {
                        SegmentCommand::Persist(batch) => {
                            if store.append_batch(&batch).is_err() {
                                io_failed.store(true, Ordering::Release);
                                break;
                            }
                        }
                        SegmentCommand::Seal { ack } => {
                            let _ = ack.send(seal(&mut store, &sealed_segments, &io_failed));
                        }
                    }
                }
                if !io_failed.load(Ordering::Acquire) {
                    let _ = seal(&mut store, &sealed_segments, &io_failed);
                }
                break;
            }
        }
    }
}

fn seal(
    store: &mut SegmentStore,
    sealed_segments: &AtomicU64,
    io_failed: &AtomicBool,
) -> Result<()> {
    match store.seal_active() {
        Ok(Some(_)) => {
            sealed_segments.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            error!(error = %e, "segment seal failed, latching fatal I/O state");
            io_failed.store(true, Ordering::Release);
            Err(NoemaError::FatalIo(e.to_string()))
        }
    }
}
