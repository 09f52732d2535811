//! The commit engine: in-memory buffer, append/flush state machine, the
//! background commit task, and superblock rotation (spec §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::overflow::{OverflowAction, OverflowPolicy, OverflowState};
use crate::record::{self, RecordFields};
use crate::ring::{Cursor, RingMap};
use crate::superblock::{self, DEVICE_BLOCK_SIZE, SUPERBLOCK_SIZE, SuperBlock, check_sb};
use crate::util::now_unix;

/// What to do when a record cannot fit under `commit_size` even before
/// ring space is considered (spec §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TooBigPolicy {
    /// Fail the originating call with [`Error::TooBig`].
    Error,
    /// Replace the record with a `TOO_BIG` marker carrying the size that
    /// would have been required.
    #[default]
    Marker,
}

/// Why a flush happened, indexing `commit_count` (spec §4.4, glossary
/// "Flush reason").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size = 0,
    Time = 1,
    Forced = 2,
}

/// Mount-time configuration (spec §3 field list, [FULL] Configuration).
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub commit_size: usize,
    pub commit_interval: Duration,
    pub overflow_policy: OverflowPolicy,
    pub too_big_policy: TooBigPolicy,
    pub alignment: u32,
    pub sync_on_commit: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            commit_size: 64 * 1024,
            commit_interval: Duration::from_secs(5),
            overflow_policy: OverflowPolicy::default(),
            too_big_policy: TooBigPolicy::default(),
            alignment: 8,
            sync_on_commit: false,
        }
    }
}

/// Everything guarded by the engine mutex: cursors, buffer pointers, and
/// the write-side scalars (spec §4.4). Not exposed outside the crate;
/// other modules reach it only through `Engine`'s `pub(crate)` accessors.
pub(crate) struct Inner {
    buffer: Vec<u8>,
    buffer_written: usize,
    buffer_read: usize,

    data_start: u64,
    data_length: u64,
    max_length: u64,
    committed: u64,

    start_ptr: Cursor,
    commit_ptr: Cursor,

    version: u64,
    last_sb_written: u32,
    last_commit: Instant,
    logged: u64,
    commit_count: [u64; 3],

    allow_commit_task: bool,
    inside_commit: bool,

    options: MountOptions,
}

/// A live, mounted journal engine. Cheap to clone via `Arc`; every method
/// takes `&self` and synchronises internally.
pub struct Engine {
    inner: Mutex<Inner>,
    log_queue: Condvar,
    data_queue: Condvar,

    overflow: OverflowState,
    device: Mutex<Box<dyn BlockDevice>>,
    ring: RingMap,

    data_space: u64,
    num_superblocks: u32,

    some_data: AtomicBool,
    task_running: AtomicBool,
    logs_valid: AtomicBool,
    stop_requested: AtomicBool,

    commit_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Writes `num_superblocks` fresh, `VALID`, empty-ring superblocks to
/// `device` (the `mkshallfs` format operation; spec §3 "Lifecycle: created").
pub fn format(device: &mut dyn BlockDevice, alignment: u32, num_superblocks: u32) -> Result<()> {
    let device_size = device.size();
    let data_space = device_size
        .checked_sub(DEVICE_BLOCK_SIZE * num_superblocks as u64)
        .ok_or(Error::Invalid)?;

    let last_sb_end =
        SuperBlock::location(num_superblocks - 1) * DEVICE_BLOCK_SIZE + SUPERBLOCK_SIZE as u64;
    if last_sb_end > device_size {
        return Err(Error::Invalid);
    }

    let sb = SuperBlock {
        device_size,
        data_space,
        data_start: 0,
        data_length: 0,
        max_length: 0,
        version: 0,
        flags: superblock::FLAG_VALID,
        alignment,
        num_superblocks,
        this_superblock: 0,
        new_size: 0,
        new_alignment: 0,
        new_superblocks: 0,
    };

    for n in 0..num_superblocks {
        let encoded = sb.encode(n);
        device.write_at(SuperBlock::byte_offset(n), &encoded)?;
    }
    device.sync()?;
    Ok(())
}

/// Reads superblock `n` off `device` with no consistency checking beyond
/// the codec's own magic/CRC verification (spec §4.1 `read_sb_raw`).
fn read_sb_raw(device: &dyn BlockDevice, n: u32) -> Option<SuperBlock> {
    let mut buf = [0u8; SUPERBLOCK_SIZE];
    device.read_at(SuperBlock::byte_offset(n), &mut buf).ok()?;
    SuperBlock::decode(&buf).map(|(sb, _)| sb)
}

/// `read_sb_raw` plus the full field-consistency check (spec §4.1
/// `read_sb`). A superblock that passes its own CRC but fails `check_sb`
/// (e.g. a `DATASPACE`/`ALIGNMENT`/`MAXLENGTH` mismatch left by a botched
/// resize) is treated the same as a missing superblock by the mount path:
/// `None`, so callers fall through to the next candidate.
fn read_sb(device: &dyn BlockDevice, n: u32, physical_size: u64) -> Option<SuperBlock> {
    let sb = read_sb_raw(device, n)?;
    if check_sb(&sb, Some(physical_size)).is_empty() { Some(sb) } else { None }
}

/// Selects the superblock to mount from, per spec §4.1 "Superblock
/// selection on mount".
fn select_superblock(device: &dyn BlockDevice) -> Result<(SuperBlock, u32)> {
    let device_size = device.size();

    let sb0 = read_sb(device, 0, device_size);
    if let Some(sb) = &sb0 {
        if sb.is_update() {
            return Err(Error::NotMounted("superblock has an interrupted update pending"));
        }
        if !sb.is_dirty() {
            return Ok((sb.clone(), 0));
        }
    }

    let mut candidate = sb0.map(|sb| (sb, 0u32));
    if candidate.is_none() {
        let mut n = 1u32;
        loop {
            if SuperBlock::location(n) * DEVICE_BLOCK_SIZE >= device_size {
                return Err(Error::Invalid);
            }
            if let Some(sb) = read_sb(device, n, device_size) {
                if sb.is_update() {
                    return Err(Error::NotMounted("superblock has an interrupted update pending"));
                }
                candidate = Some((sb, n));
                break;
            }
            n += 1;
        }
    }

    let (sb, index) = candidate.unwrap();
    if !sb.is_dirty() {
        return Ok((sb, index));
    }

    // Dirty: the last mount didn't shut down cleanly. Scan every
    // superblock and pick the highest version.
    let mut best: Option<(SuperBlock, u32)> = None;
    for n in 0..sb.num_superblocks {
        if SuperBlock::location(n) * DEVICE_BLOCK_SIZE >= device_size {
            break;
        }
        if let Some(candidate_sb) = read_sb(device, n, device_size) {
            let better = match &best {
                Some((best_sb, _)) => candidate_sb.version > best_sb.version,
                None => true,
            };
            if better {
                best = Some((candidate_sb, n));
            }
        }
    }
    best.ok_or(Error::Invalid)
}

impl Engine {
    /// Mounts `device`, selecting the most recent valid superblock,
    /// marking it `DIRTY`, and starting the background commit task (spec
    /// §3 "Lifecycle: mounted").
    pub fn mount(mut device: Box<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Self>> {
        let (mut sb, index) = select_superblock(device.as_ref())?;

        let ring = RingMap::new(sb.num_superblocks, sb.data_space);
        let start_ptr = ring.locate(sb.data_start);
        let commit_logical = (sb.data_start + sb.data_length) % sb.data_space.max(1);
        let commit_ptr = ring.locate(commit_logical);

        sb.flags |= superblock::FLAG_DIRTY;
        let encoded = sb.encode(index);
        device.write_at(SuperBlock::byte_offset(index), &encoded)?;

        let data_space = sb.data_space;
        let num_superblocks = sb.num_superblocks;

        let inner = Inner {
            buffer: vec![0u8; options.commit_size],
            buffer_written: 0,
            buffer_read: 0,
            data_start: sb.data_start,
            data_length: sb.data_length,
            max_length: sb.max_length,
            committed: sb.data_length,
            start_ptr,
            commit_ptr,
            version: sb.version,
            last_sb_written: index,
            last_commit: Instant::now(),
            logged: 0,
            commit_count: [0; 3],
            allow_commit_task: true,
            inside_commit: false,
            options,
        };

        let engine = Arc::new(Engine {
            inner: Mutex::new(inner),
            log_queue: Condvar::new(),
            data_queue: Condvar::new(),
            overflow: OverflowState::new(),
            device: Mutex::new(device),
            ring,
            data_space,
            num_superblocks,
            some_data: AtomicBool::new(sb.data_length > 0),
            task_running: AtomicBool::new(true),
            logs_valid: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            commit_thread: Mutex::new(None),
        });

        info!("mounted superblock {index} at version {}", sb.version);

        let task_engine = Arc::clone(&engine);
        let handle = std::thread::spawn(move || task_engine.commit_task());
        *engine.commit_thread.lock().unwrap() = Some(handle);

        Ok(engine)
    }

    /// Appends one caller-supplied record (spec §4.4 `append`).
    pub fn append(&self, fields: RecordFields) -> Result<()> {
        let (alignment, commit_size) = {
            let guard = self.inner.lock().unwrap();
            (guard.options.alignment, guard.options.commit_size)
        };

        let bytes = match record::encode_record(&fields, alignment, commit_size) {
            Some(b) => b,
            None => match self.too_big_policy() {
                TooBigPolicy::Error => {
                    return Err(Error::TooBig(record::pad_to_alignment(fields.required_len(), alignment)));
                }
                TooBigPolicy::Marker => {
                    record::encode_too_big_marker(fields.required_len() as u64, alignment)
                }
            },
        };

        let mut guard = self.inner.lock().unwrap();
        guard = self
            .log_queue
            .wait_while(guard, |i| !i.allow_commit_task)
            .map_err(|_| Error::Interrupted)?;

        // commit_size may have shrunk under a concurrent remount.
        if bytes.len() > guard.options.commit_size {
            return Err(Error::TooBig(bytes.len()));
        }

        let record_len = bytes.len() as u64;
        let will_overflow =
            record_len + record::HEADER_SIZE as u64 + guard.data_length > self.data_space;

        let mut guard = if will_overflow {
            match self.handle_overflow(guard, record_len)? {
                Some(g) => g,
                None => return Ok(()), // dropped under DROP policy
            }
        } else {
            guard
        };

        guard = self.insert_into_buffer_locked(guard, &bytes)?;
        drop(guard);

        self.some_data.store(true, Ordering::Release);
        self.data_queue.notify_all();
        Ok(())
    }

    /// Inserts an already-encoded record (an `OVERFLOW`/`RECOVER` marker,
    /// or a control-channel `userlog`) straight into the buffer, bypassing
    /// the ring-space overflow check. Used by the consumer reader to emit
    /// a `RECOVER` marker after a drain frees space (spec §4.6).
    pub(crate) fn append_raw(&self, bytes: Vec<u8>) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let guard = self.insert_into_buffer_locked(guard, &bytes)?;
        drop(guard);
        self.some_data.store(true, Ordering::Release);
        self.data_queue.notify_all();
        Ok(())
    }

    /// Copies `bytes` into the commit buffer, flushing first if the
    /// buffer does not currently have room (spec §4.4 `append` steps 6–7).
    /// Shared between ordinary appends and the marker records the overflow
    /// controller emits, since both ultimately land in the same buffer.
    fn insert_into_buffer_locked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
        bytes: &[u8],
    ) -> Result<MutexGuard<'a, Inner>> {
        if guard.buffer_written + bytes.len() > guard.options.commit_size {
            guard = self.flush_locked(guard, FlushReason::Size)?;
        }

        let start = guard.buffer_written;
        guard.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        guard.buffer_written += bytes.len();
        guard.data_length += bytes.len() as u64;
        guard.max_length = guard.max_length.max(guard.data_length);
        guard.logged += 1;

        Ok(guard)
    }

    /// Registers one overflowing record with the controller, emitting the
    /// `OVERFLOW` marker the first time (spec §4.5 steps 1–2).
    fn register_overflow<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
        record_len: u64,
    ) -> Result<MutexGuard<'a, Inner>> {
        let action = self.overflow.on_overflow(record_len);
        if action == OverflowAction::EmitMarker {
            let (sec, nsec) = now_unix();
            let marker = record::encode_overflow_marker(sec, nsec);
            warn!("ring overflow: emitting OVERFLOW marker");
            guard = self.insert_into_buffer_locked(guard, &marker)?;
        }
        Ok(guard)
    }

    /// Runs the overflow controller (spec §4.5). Returns `Ok(Some(guard))`
    /// with the mutex re-acquired and enough space confirmed, or
    /// `Ok(None)` if the record was dropped under `DROP` policy.
    fn handle_overflow<'a>(
        &'a self,
        guard: MutexGuard<'a, Inner>,
        record_len: u64,
    ) -> Result<Option<MutexGuard<'a, Inner>>> {
        let mut guard = self.register_overflow(guard, record_len)?;

        loop {
            match guard.options.overflow_policy {
                OverflowPolicy::Drop => return Ok(None),
                OverflowPolicy::Wait => {
                    guard = self
                        .log_queue
                        .wait_timeout(guard, Duration::from_millis(100))
                        .map_err(|_| Error::Interrupted)?
                        .0;

                    if self.overflow.num_dropped() == 0 {
                        // Reacquire and re-check space (spec §4.5): a
                        // second producer may have claimed it between the
                        // wake and here.
                        let still_overflowing = record_len
                            + record::HEADER_SIZE as u64
                            + guard.data_length()
                            > self.data_space;
                        if !still_overflowing {
                            return Ok(Some(guard));
                        }
                        guard = self.register_overflow(guard, record_len)?;
                    }
                }
            }
        }
    }

    fn commit_size(&self) -> usize {
        self.inner.lock().unwrap().options.commit_size
    }

    fn too_big_policy(&self) -> TooBigPolicy {
        self.inner.lock().unwrap().options.too_big_policy
    }

    /// Drains the unread portion of the buffer to the device, releasing
    /// the mutex for each physical write (spec §4.4 `flush_buffer`, §9
    /// "Release-during-I/O flush pattern").
    fn flush_locked<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        reason: FlushReason,
    ) -> Result<MutexGuard<'a, Inner>> {
        while inner.buffer_read < inner.buffer_written {
            debug_assert_eq!(
                inner.committed + (inner.buffer_written - inner.buffer_read) as u64,
                inner.data_length
            );

            let block = inner.commit_ptr.block;
            let offset = inner.commit_ptr.offset;
            let todo = ((DEVICE_BLOCK_SIZE as u32 - offset) as usize)
                .min(inner.buffer_written - inner.buffer_read);

            let chunk_start = inner.buffer_read;
            let mut chunk = vec![0u8; todo];
            chunk.copy_from_slice(&inner.buffer[chunk_start..chunk_start + todo]);

            inner.commit_ptr = self.ring.advance(inner.commit_ptr, todo as u64);
            inner.committed += todo as u64;
            inner.buffer_read += todo;

            let offset_bytes = block * DEVICE_BLOCK_SIZE + offset as u64;
            // Release the engine mutex for the physical write; re-acquired
            // immediately after. This is the only window in which the
            // buffer's unflushed tail may grow concurrently (spec §4.4).
            drop(inner);
            {
                let mut device = self.device.lock().unwrap();
                device.write_at(offset_bytes, &chunk)?;
            }
            inner = self.inner.lock().unwrap();
        }

        inner.buffer_read = 0;
        inner.buffer_written = 0;
        inner.version += 1;
        inner.last_commit = Instant::now();
        inner.commit_count[reason as usize] += 1;

        let next_sb = if inner.last_sb_written == 0 || inner.last_sb_written + 1 >= self.num_superblocks
        {
            1
        } else {
            inner.last_sb_written + 1
        };

        let sb = SuperBlock {
            device_size: self.data_space + DEVICE_BLOCK_SIZE * self.num_superblocks as u64,
            data_space: self.data_space,
            data_start: inner.data_start,
            data_length: inner.data_length,
            max_length: inner.max_length,
            version: inner.version,
            flags: superblock::FLAG_VALID | superblock::FLAG_DIRTY,
            alignment: inner.options.alignment,
            num_superblocks: self.num_superblocks,
            this_superblock: next_sb,
            new_size: 0,
            new_alignment: 0,
            new_superblocks: 0,
        };
        let encoded = sb.encode(next_sb);
        let sync_on_commit = inner.options.sync_on_commit;
        inner.last_sb_written = next_sb;

        drop(inner);
        {
            let mut device = self.device.lock().unwrap();
            device.write_at(SuperBlock::byte_offset(next_sb), &encoded)?;
            if sync_on_commit {
                device.sync()?;
            }
        }
        let inner = self.inner.lock().unwrap();

        info!("commit: reason={reason:?} version={} sb={next_sb}", sb.version);
        Ok(inner)
    }

    /// The background actor: sleeps for the commit interval, wakes, and
    /// flushes unless a remount or another in-flight commit says not to
    /// (spec §4.4 `commit_task`).
    fn commit_task(self: Arc<Self>) {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }

            let wait_for = {
                let inner = self.inner.lock().unwrap();
                inner.options.commit_interval.saturating_sub(inner.last_commit.elapsed())
            };
            std::thread::sleep(wait_for.min(Duration::from_millis(250)));

            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }

            let mut inner = self.inner.lock().unwrap();
            if !inner.allow_commit_task || inner.inside_commit {
                debug!("commit_task: skipping, remount or commit in progress");
                continue;
            }
            if inner.last_commit.elapsed() < inner.options.commit_interval {
                continue;
            }
            inner.inside_commit = true;
            drop(inner);

            match self.flush_locked(self.inner.lock().unwrap(), FlushReason::Time) {
                Ok(inner) => drop(inner),
                Err(e) => warn!("commit_task: flush failed: {e}"),
            }

            self.inner.lock().unwrap().inside_commit = false;
            self.log_queue.notify_all();
        }

        self.task_running.store(false, Ordering::Release);
    }

    /// A synchronous, forced flush (spec §4.4 `commit(barrier)`): the
    /// `commit` admin command and the pre-unmount drain both call this.
    pub fn commit(&self) -> Result<()> {
        self.commit_with(|_| {})
    }

    /// Same as [`Engine::commit`], but runs `barrier` under the mutex
    /// immediately after the flush completes and before `allow_commit_task`
    /// is restored — used by the consumer reader to fold a cursor update
    /// or a `RECOVER` marker into the same barrier (spec §4.4, §4.6).
    pub(crate) fn commit_with<F>(&self, barrier: F) -> Result<()>
    where
        F: FnOnce(&mut Inner),
    {
        let mut inner = self.inner.lock().unwrap();
        let previous_allow = inner.allow_commit_task;
        inner.allow_commit_task = false;

        inner = self
            .log_queue
            .wait_while(inner, |i| i.inside_commit)
            .map_err(|_| Error::Interrupted)?;

        let mut inner = self.flush_locked(inner, FlushReason::Forced)?;
        barrier(&mut inner);
        inner.allow_commit_task = previous_allow;
        drop(inner);
        self.log_queue.notify_all();
        Ok(())
    }

    /// Unmounts: stops the commit task, runs a final flush, and marks a
    /// spread of superblocks clean (spec §3 "Lifecycle: unmounted").
    pub fn unmount(self: Arc<Self>) -> Result<()> {
        self.logs_valid.store(false, Ordering::Release);
        self.stop_requested.store(true, Ordering::Release);
        self.log_queue.notify_all();
        self.data_queue.notify_all();

        if let Some(handle) = self.commit_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.commit()?;

        let inner = self.inner.lock().unwrap();
        let spread = (self.num_superblocks / 7).max(1);
        let mut n = 0u32;
        let mut device = self.device.lock().unwrap();
        while n < self.num_superblocks {
            let sb = SuperBlock {
                device_size: self.data_space + DEVICE_BLOCK_SIZE * self.num_superblocks as u64,
                data_space: self.data_space,
                data_start: inner.data_start,
                data_length: inner.data_length,
                max_length: inner.max_length,
                version: inner.version,
                flags: superblock::FLAG_VALID,
                alignment: inner.options.alignment,
                num_superblocks: self.num_superblocks,
                this_superblock: n,
                new_size: 0,
                new_alignment: 0,
                new_superblocks: 0,
            };
            device.write_at(SuperBlock::byte_offset(n), &sb.encode(n))?;
            n += spread;
        }
        device.sync()?;
        Ok(())
    }

    pub fn data_space(&self) -> u64 {
        self.data_space
    }

    pub fn num_superblocks(&self) -> u32 {
        self.num_superblocks
    }

    pub(crate) fn inner(&self) -> &Mutex<Inner> {
        &self.inner
    }

    pub(crate) fn data_queue(&self) -> &Condvar {
        &self.data_queue
    }

    pub(crate) fn log_queue(&self) -> &Condvar {
        &self.log_queue
    }

    pub(crate) fn overflow(&self) -> &OverflowState {
        &self.overflow
    }

    pub(crate) fn ring(&self) -> &RingMap {
        &self.ring
    }

    pub(crate) fn device(&self) -> &Mutex<Box<dyn BlockDevice>> {
        &self.device
    }

    pub fn some_data(&self) -> bool {
        self.some_data.load(Ordering::Acquire)
    }

    pub fn logs_valid(&self) -> bool {
        self.logs_valid.load(Ordering::Acquire)
    }

    pub fn task_running(&self) -> bool {
        self.task_running.load(Ordering::Acquire)
    }

    pub fn commit_counts(&self) -> [u64; 3] {
        self.inner.lock().unwrap().commit_count
    }
}

impl Inner {
    pub fn data_start(&self) -> u64 {
        self.data_start
    }
    pub fn data_length(&self) -> u64 {
        self.data_length
    }
    pub(crate) fn start_ptr(&self) -> Cursor {
        self.start_ptr
    }
    pub(crate) fn set_start_ptr(&mut self, cur: Cursor) {
        self.start_ptr = cur;
    }
    pub(crate) fn set_data_start(&mut self, v: u64) {
        self.data_start = v;
    }
    pub(crate) fn shrink_data_length(&mut self, by: u64) {
        self.data_length = self.data_length.saturating_sub(by);
    }
    pub(crate) fn buffer_slice(&self) -> &[u8] {
        &self.buffer[self.buffer_read..self.buffer_written]
    }
    /// Reads `len` bytes out of the buffer starting at absolute index
    /// `abs_start` (i.e. not relative to `buffer_read`). Used by the
    /// consumer reader once it has located the uncommitted tail.
    pub(crate) fn buffer_bytes_at(&self, abs_start: usize, len: usize) -> &[u8] {
        &self.buffer[abs_start..abs_start + len]
    }
    pub(crate) fn buffer_read(&self) -> usize {
        self.buffer_read
    }
    pub(crate) fn committed(&self) -> u64 {
        self.committed
    }
    pub(crate) fn alignment(&self) -> u32 {
        self.options.alignment
    }
}
