//! Single-producer / single-consumer ring of interleaved `f32` frames.
//!
//! Storage is a `ringbuf` heap ring split into its producer and consumer halves.
//! The halves are parked in the [`RingBuffer`] until claimed: the renderer thread
//! writes through a [`RingWriter`], the output callback reads through a
//! [`RingReader`], and neither takes a lock while moving samples.
//!
//! Occupancy is also published through two monotonic frame counters so the
//! controller and telemetry can observe the fill level without holding a handle.
//! The writer bumps its counter after pushing and the reader after popping, so a
//! snapshot taken on either side errs towards that side's safe direction.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::error::StreamError;

/// Largest ring accepted, ~87 s at 48 kHz.
pub const MAX_CAPACITY_FRAMES: usize = 1 << 22;

/// Whether this target offers the lock-free atomics the ring is built on.
pub fn shared_memory_supported() -> bool {
    cfg!(target_has_atomic = "ptr") && cfg!(target_has_atomic = "64")
}

pub struct RingBuffer {
    capacity_frames: usize,
    channels: usize,
    block_frames: usize,
    producer: Mutex<Option<HeapProd<f32>>>,
    consumer: Mutex<Option<HeapCons<f32>>>,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    finished: AtomicBool,
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity_frames", &self.capacity_frames)
            .field("channels", &self.channels)
            .field("block_frames", &self.block_frames)
            .field("occupancy", &self.occupancy())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RingBuffer {
    /// Allocate a ring for `capacity_frames` frames of `channels` interleaved samples.
    pub fn new(
        capacity_frames: usize,
        channels: usize,
        block_frames: usize,
    ) -> Result<Arc<Self>, StreamError> {
        if channels == 0 || block_frames == 0 {
            return Err(StreamError::Initialization(format!(
                "ring needs channels > 0 and block > 0 (got {channels}, {block_frames})"
            )));
        }
        if capacity_frames < block_frames || capacity_frames > MAX_CAPACITY_FRAMES {
            return Err(StreamError::Initialization(format!(
                "ring capacity {capacity_frames} outside [{block_frames}, {MAX_CAPACITY_FRAMES}]"
            )));
        }
        let (producer, consumer) = HeapRb::<f32>::new(capacity_frames * channels).split();
        tracing::debug!(capacity_frames, channels, block_frames, "ring buffer created");
        Ok(Arc::new(Self {
            capacity_frames,
            channels,
            block_frames,
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            frames_written: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }))
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// Frames buffered and readable (best-effort snapshot from either side).
    pub fn occupancy(&self) -> usize {
        // Read counter first: the write counter loaded after it can only be ahead.
        let read = self.frames_read.load(Ordering::Acquire);
        let written = self.frames_written.load(Ordering::Acquire);
        (written.saturating_sub(read) as usize).min(self.capacity_frames)
    }

    /// Frames that can be written without overwriting unread data.
    pub fn available_write(&self) -> usize {
        self.capacity_frames - self.occupancy()
    }

    /// Flag end-of-stream; the reader treats a drained, finished ring as ended.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Claim the producer side. Returns `None` while another writer is alive.
    pub fn writer(self: &Arc<Self>) -> Option<RingWriter> {
        let producer = slot(&self.producer).take()?;
        Some(RingWriter {
            ring: self.clone(),
            producer: Some(producer),
        })
    }

    /// Claim the consumer side. Returns `None` while another reader is alive.
    pub fn reader(self: &Arc<Self>) -> Option<RingReader> {
        let consumer = slot(&self.consumer).take()?;
        Some(RingReader {
            ring: self.clone(),
            consumer: Some(consumer),
        })
    }
}

/// Unique producer handle.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
    producer: Option<HeapProd<f32>>,
}

impl RingWriter {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Write as many complete interleaved frames from `samples` as fit.
    ///
    /// Returns the number of frames written; 0 when the ring is full. A trailing
    /// partial frame in `samples` is never written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let Some(producer) = self.producer.as_mut() else {
            return 0;
        };
        let ch = self.ring.channels;
        let frames = (samples.len() / ch).min(producer.vacant_len() / ch);
        if frames == 0 {
            return 0;
        }
        let pushed = producer.push_slice(&samples[..frames * ch]);
        debug_assert_eq!(pushed, frames * ch);
        self.ring
            .frames_written
            .fetch_add(frames as u64, Ordering::Release);
        frames
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            *slot(&self.ring.producer) = Some(producer);
        }
    }
}

/// Unique consumer handle.
pub struct RingReader {
    ring: Arc<RingBuffer>,
    consumer: Option<HeapCons<f32>>,
}

impl RingReader {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// De-interleave up to `frames` frames into per-channel `outputs`.
    ///
    /// Any shortfall (and any output channel the ring does not carry) is zero-filled.
    /// Returns the frames actually taken from the ring. Never blocks or allocates.
    pub fn read<B: AsMut<[f32]>>(&mut self, outputs: &mut [B], frames: usize) -> usize {
        let ch = self.ring.channels;
        let Some(consumer) = self.consumer.as_mut() else {
            for out in outputs.iter_mut() {
                out.as_mut().fill(0.0);
            }
            return 0;
        };
        let n = frames.min(consumer.occupied_len() / ch);

        for out in outputs.iter_mut() {
            let out = out.as_mut();
            let want = frames.min(out.len());
            out[n.min(want)..want].fill(0.0);
        }
        for (i, &sample) in consumer.iter().take(n * ch).enumerate() {
            let (frame, out_ch) = (i / ch, i % ch);
            if let Some(out) = outputs.get_mut(out_ch) {
                if let Some(dst) = out.as_mut().get_mut(frame) {
                    *dst = sample;
                }
            }
        }
        for out in outputs.iter_mut().skip(ch) {
            let out = out.as_mut();
            let want = frames.min(out.len());
            out[..want].fill(0.0);
        }

        if n > 0 {
            consumer.skip(n * ch);
            self.ring.frames_read.fetch_add(n as u64, Ordering::Release);
        }
        n
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            *slot(&self.ring.consumer) = Some(consumer);
        }
    }
}
