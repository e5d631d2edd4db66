//! Fixed pool of capture/playback buffers.
//!
//! Each buffer pairs a capture region (filled by the input device) with a
//! playback region (handed to the output device). Buffers cycle between
//! the capture queue, the completion callback, and the playback queue for
//! the whole life of a connection, so the pool is allocated once at connect
//! time and never resized.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Number of buffers cycled between capture and playback.
pub const NUM_BUFFERS: usize = 4;

/// Size of each capture and playback region in bytes.
pub const BUFFER_SIZE: usize = 4096;

/// Transfer state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Queued with a device or unused; no callback is touching it.
    Idle = 0,
    /// A completion callback is currently processing it.
    InFlight = 1,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BufferState::InFlight,
            _ => BufferState::Idle,
        }
    }
}

/// One capture region, one playback region, and the state flag guarding
/// their release.
///
/// The state flag is written by the completion callback while it runs and
/// read by the control thread while draining. Region bytes sit behind their
/// own mutexes, held only for the duration of a copy.
#[derive(Debug)]
pub struct AudioBuffer {
    index: usize,
    capture: Mutex<Box<[u8]>>,
    playback: Mutex<Box<[u8]>>,
    state: AtomicU8,
}

impl AudioBuffer {
    /// Creates a zeroed, idle buffer.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            capture: Mutex::new(vec![0u8; BUFFER_SIZE].into_boxed_slice()),
            playback: Mutex::new(vec![0u8; BUFFER_SIZE].into_boxed_slice()),
            state: AtomicU8::new(BufferState::Idle as u8),
        }
    }

    /// Position of this buffer in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current transfer state.
    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns true while a callback owns the buffer.
    pub fn is_in_flight(&self) -> bool {
        self.state() == BufferState::InFlight
    }

    /// Marks the start of a completion callback.
    ///
    /// SeqCst pairs with the shutdown flag: the callback stores this before
    /// loading the flag, the control thread stores the flag before loading
    /// this.
    pub fn mark_in_flight(&self) {
        self.state
            .store(BufferState::InFlight as u8, Ordering::SeqCst);
    }

    /// Marks the end of a completion callback.
    pub fn mark_idle(&self) {
        self.state.store(BufferState::Idle as u8, Ordering::SeqCst);
    }

    /// Zeroes both regions.
    pub fn zero(&self) {
        if let Ok(mut capture) = self.capture.lock() {
            capture.fill(0);
        }
        if let Ok(mut playback) = self.playback.lock() {
            playback.fill(0);
        }
    }

    /// Writes captured bytes into the capture region starting at `offset`.
    ///
    /// Returns the number of bytes written, which is less than `bytes.len()`
    /// when the region is full.
    pub fn write_capture(&self, offset: usize, bytes: &[u8]) -> usize {
        let Ok(mut capture) = self.capture.lock() else {
            return 0;
        };
        if offset >= BUFFER_SIZE {
            return 0;
        }
        let count = bytes.len().min(BUFFER_SIZE - offset);
        capture[offset..offset + count].copy_from_slice(&bytes[..count]);
        count
    }

    /// Copies the first `len` captured bytes into the playback region.
    ///
    /// Returns the number of bytes copied (clamped to the region size).
    pub fn copy_capture_to_playback(&self, len: usize) -> usize {
        let len = len.min(BUFFER_SIZE);
        let (Ok(capture), Ok(mut playback)) = (self.capture.lock(), self.playback.lock()) else {
            return 0;
        };
        playback[..len].copy_from_slice(&capture[..len]);
        len
    }

    /// Runs `f` over the first `len` bytes of the playback region.
    pub fn with_playback<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let len = len.min(BUFFER_SIZE);
        let playback = self.playback.lock().ok()?;
        Some(f(&playback[..len]))
    }
}

/// The ordered set of buffers used by one audio connection.
///
/// Buffers are reference counted so devices can hold the regions they have
/// registered; the pool itself never hands out ownership of a buffer to
/// anything but a device registration.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<Arc<AudioBuffer>>,
}

impl BufferPool {
    /// Allocates `count` zeroed, idle buffers indexed `0..count`.
    pub fn new(count: usize) -> Self {
        Self {
            buffers: (0..count).map(|i| Arc::new(AudioBuffer::new(i))).collect(),
        }
    }

    /// Allocates the standard pool of [`NUM_BUFFERS`] buffers.
    pub fn allocate() -> Self {
        Self::new(NUM_BUFFERS)
    }

    /// Gets a buffer by index.
    pub fn get(&self, index: usize) -> Option<&Arc<AudioBuffer>> {
        self.buffers.get(index)
    }

    /// Iterates over the buffers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AudioBuffer>> {
        self.buffers.iter()
    }

    /// Returns true when no buffer is in flight.
    pub fn all_idle(&self) -> bool {
        self.buffers.iter().all(|b| !b.is_in_flight())
    }

    /// Number of buffers currently owned by a callback.
    pub fn in_flight_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_in_flight()).count()
    }

    /// Returns the total number of allocated buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if no buffers are allocated.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
