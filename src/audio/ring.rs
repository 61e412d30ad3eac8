//! Lock-free single-producer/single-consumer PCM ring.
//!
//! The producer half lives in the audio callback, the consumer half in the
//! worker thread. Neither side ever blocks or allocates after construction.
//! Indices are free-running counters; slot positions are `index & mask`.
//! Samples are stored as raw `f32` bits in `AtomicU32` slots so a sample can
//! never tear, while the release/acquire pair on the indices makes the
//! sample stores visible before the index advance.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    slots: Box<[AtomicU32]>,
    mask: usize,
    /// Advanced only by the producer
    write: AtomicUsize,
    /// Advanced only by the consumer
    read: AtomicUsize,
    /// Samples dropped because the ring was full
    overruns: AtomicU64,
    /// Arrival stamp of the most recent write: (end position, clock ns).
    /// `stamp_seq` is odd while the pair is being updated.
    stamp_seq: AtomicUsize,
    stamp_pos: AtomicUsize,
    stamp_ns: AtomicU64,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

/// Write-only half of the ring, owned by the capture side
pub struct PcmProducer {
    shared: Arc<Shared>,
}

/// Read-only half of the ring, owned by the frame assembler
pub struct PcmConsumer {
    shared: Arc<Shared>,
}

/// Create a ring able to hold at least `min_capacity` samples.
///
/// The real capacity is rounded up to a power of two. One slot is kept free
/// so occupancy is always strictly below capacity.
pub fn pcm_ring(min_capacity: usize) -> (PcmProducer, PcmConsumer) {
    let capacity = (min_capacity.max(2) + 1).next_power_of_two();
    let slots: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(0)).collect();
    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
        overruns: AtomicU64::new(0),
        stamp_seq: AtomicUsize::new(0),
        stamp_pos: AtomicUsize::new(0),
        stamp_ns: AtomicU64::new(0),
    });
    (
        PcmProducer {
            shared: shared.clone(),
        },
        PcmConsumer { shared },
    )
}

impl PcmProducer {
    /// Push samples, returning how many were accepted.
    ///
    /// When the ring is full the tail of `samples` is dropped and counted as
    /// overrun. Wait-free; safe to call from a realtime callback.
    #[inline]
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let shared = &*self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let occupied = write.wrapping_sub(read);
        let free = shared.capacity() - 1 - occupied;
        let accepted = samples.len().min(free);

        for (offset, sample) in samples[..accepted].iter().enumerate() {
            shared.slots[write.wrapping_add(offset) & shared.mask]
                .store(sample.to_bits(), Ordering::Relaxed);
        }
        shared
            .write
            .store(write.wrapping_add(accepted), Ordering::Release);

        let dropped = samples.len() - accepted;
        if dropped > 0 {
            shared.overruns.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        accepted
    }

    /// Push `count` zero samples (gap fill after a device re-open)
    pub fn write_silence(&mut self, count: usize) -> usize {
        const ZEROS: [f32; 256] = [0.0; 256];
        let mut remaining = count;
        let mut accepted = 0;
        while remaining > 0 {
            let chunk = remaining.min(ZEROS.len());
            accepted += self.write(&ZEROS[..chunk]);
            remaining -= chunk;
        }
        accepted
    }

    /// Record that everything written so far had arrived by `now_ns`
    #[inline]
    pub fn stamp(&mut self, now_ns: u64) {
        let shared = &*self.shared;
        let pos = shared.write.load(Ordering::Relaxed);
        let seq = shared.stamp_seq.load(Ordering::Relaxed);
        shared.stamp_seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        shared.stamp_pos.store(pos, Ordering::Relaxed);
        shared.stamp_ns.store(now_ns, Ordering::Relaxed);
        shared.stamp_seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Total samples dropped because the ring was full
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

impl PcmConsumer {
    /// Samples currently readable (consumer-side snapshot)
    #[inline]
    pub fn available(&self) -> usize {
        let read = self.shared.read.load(Ordering::Relaxed);
        let write = self.shared.write.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Copy exactly `n` samples into `dst[..n]`.
    ///
    /// Returns 0 without consuming anything if fewer than `n` are available.
    #[inline]
    pub fn read_into(&mut self, dst: &mut [f32], n: usize) -> usize {
        let n = n.min(dst.len());
        if n == 0 || self.available() < n {
            return 0;
        }
        let shared = &*self.shared;
        let read = shared.read.load(Ordering::Relaxed);
        for (offset, out) in dst[..n].iter_mut().enumerate() {
            *out = f32::from_bits(
                shared.slots[read.wrapping_add(offset) & shared.mask].load(Ordering::Relaxed),
            );
        }
        shared.read.store(read.wrapping_add(n), Ordering::Release);
        n
    }

    /// Discard everything currently buffered, returning the count
    pub fn skip_all(&mut self) -> usize {
        let available = self.available();
        let read = self.shared.read.load(Ordering::Relaxed);
        self.shared
            .read
            .store(read.wrapping_add(available), Ordering::Release);
        available
    }

    /// Free-running read position (samples consumed so far)
    pub fn position(&self) -> usize {
        self.shared.read.load(Ordering::Relaxed)
    }

    /// Estimate when the sample at free-running position `pos` entered the
    /// ring, given the stream's sample throughput in samples per second.
    ///
    /// Returns `None` until the producer has stamped at least once.
    pub fn arrival_ns(&self, pos: usize, samples_per_sec: f64) -> Option<u64> {
        let shared = &*self.shared;
        let (stamp_pos, stamp_ns) = loop {
            let seq = shared.stamp_seq.load(Ordering::Acquire);
            if seq == 0 {
                return None;
            }
            if seq % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let stamp_pos = shared.stamp_pos.load(Ordering::Relaxed);
            let stamp_ns = shared.stamp_ns.load(Ordering::Relaxed);
            std::sync::atomic::fence(Ordering::Acquire);
            if shared.stamp_seq.load(Ordering::Relaxed) == seq {
                break (stamp_pos, stamp_ns);
            }
        };

        // Samples written after `pos` up to the stamp arrived later than `pos`
        let behind = stamp_pos.wrapping_sub(pos) as isize;
        let offset_ns = behind as f64 / samples_per_sec.max(1.0) * 1e9;
        Some((stamp_ns as f64 - offset_ns).max(0.0) as u64)
    }

    /// Total samples dropped by the producer
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}
