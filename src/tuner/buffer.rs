//! Lock-free ring buffer carrying the MPEG-TS byte stream.
//!
//! Single producer (the RTP receiver), single consumer (the host draining
//! `get_data`). The producer never blocks: data that does not fit is
//! dropped and counted.

use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// A lock-free SPSC ring buffer for TS data.
pub struct TsRingBuffer {
    buffer: Box<[u8]>,
    capacity: usize,
    /// Write position (updated by the RTP receiver).
    write_pos: AtomicUsize,
    /// Read position (updated by the consumer).
    read_pos: AtomicUsize,
    /// Total bytes dropped on overflow.
    overflow: AtomicU64,
}

impl TsRingBuffer {
    /// Create a buffer of roughly `capacity` bytes, aligned down to the TS
    /// packet size.
    pub fn new(capacity: usize) -> Self {
        let capacity = (capacity.max(2 * TS_PACKET_SIZE) / TS_PACKET_SIZE) * TS_PACKET_SIZE + 1;
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            overflow: AtomicU64::new(0),
        }
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    /// Bytes of free space for writing.
    pub fn free_space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    /// Write data, returning the number of bytes actually stored. The
    /// shortfall is added to the overflow counter.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        let free = if write >= read {
            self.capacity - write + read - 1
        } else {
            read - write - 1
        };

        let to_write = data.len().min(free);
        if to_write < data.len() {
            self.overflow
                .fetch_add((data.len() - to_write) as u64, Ordering::Relaxed);
        }
        if to_write == 0 {
            return 0;
        }

        // Raw pointer copy; the producer side owns write_pos exclusively.
        let dst = self.buffer.as_ptr() as *mut u8;
        let first_chunk = to_write.min(self.capacity - write);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst.add(write), first_chunk);
            if first_chunk < to_write {
                ptr::copy_nonoverlapping(data.as_ptr().add(first_chunk), dst, to_write - first_chunk);
            }
        }

        write = (write + to_write) % self.capacity;
        self.write_pos.store(write, Ordering::Release);
        to_write
    }

    /// A contiguous readable run of at most `max_len` bytes. The slice is
    /// valid until the next `consume`.
    pub fn read(&self, max_len: usize) -> &[u8] {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        let contiguous = if write >= read {
            write - read
        } else {
            self.capacity - read
        };

        let to_read = max_len.min(contiguous);
        &self.buffer[read..read + to_read]
    }

    /// Consume bytes from the read position.
    pub fn consume(&self, count: usize) {
        let count = count.min(self.available());
        let read = self.read_pos.load(Ordering::Acquire);
        self.read_pos
            .store((read + count) % self.capacity, Ordering::Release);
    }

    /// Total bytes dropped so far.
    pub fn overflow_bytes(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }
}

// Safety: positions are synchronized with acquire/release atomics and each
// side mutates only its own index.
unsafe impl Send for TsRingBuffer {}
unsafe impl Sync for TsRingBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let buffer = TsRingBuffer::new(TS_PACKET_SIZE * 16);
        let data = vec![TS_SYNC_BYTE; TS_PACKET_SIZE * 4];
        assert_eq!(buffer.write(&data), data.len());
        assert_eq!(buffer.available(), data.len());

        let run = buffer.read(TS_PACKET_SIZE);
        assert_eq!(run.len(), TS_PACKET_SIZE);
        assert_eq!(run[0], TS_SYNC_BYTE);
        buffer.consume(TS_PACKET_SIZE);
        assert_eq!(buffer.available(), TS_PACKET_SIZE * 3);
    }

    #[test]
    fn overflow_is_counted_not_blocking() {
        let buffer = TsRingBuffer::new(TS_PACKET_SIZE * 2);
        let data = vec![0u8; TS_PACKET_SIZE * 4];
        let written = buffer.write(&data);
        assert!(written < data.len());
        assert_eq!(buffer.overflow_bytes(), (data.len() - written) as u64);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let buffer = TsRingBuffer::new(TS_PACKET_SIZE * 4);
        let first = vec![1u8; TS_PACKET_SIZE * 3];
        buffer.write(&first);
        buffer.consume(TS_PACKET_SIZE * 3);

        let second: Vec<u8> = (0..TS_PACKET_SIZE * 2).map(|i| (i % 251) as u8).collect();
        assert_eq!(buffer.write(&second), second.len());

        let mut collected = Vec::new();
        while !buffer.is_empty() {
            let run = buffer.read(usize::MAX);
            collected.extend_from_slice(run);
            let n = run.len();
            buffer.consume(n);
        }
        assert_eq!(collected, second);
    }

    #[test]
    fn clear_resets() {
        let buffer = TsRingBuffer::new(TS_PACKET_SIZE * 4);
        buffer.write(&[1, 2, 3]);
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
