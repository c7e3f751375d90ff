/// Fixed-capacity byte queue with separate read and write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity`. The unread region is
/// `buf[read_pos..write_pos]`. No operation fails; writers observe short
/// writes when space runs out and that shortage is the backpressure signal.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], read_pos: 0, write_pos: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.data_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Contiguous writable region. Reclaims the consumed prefix first so the
    /// whole free space is usable.
    pub fn write_slice(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.buf[self.write_pos..]
    }

    pub fn advance_write(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n).min(self.capacity());
    }

    /// Unread bytes in arrival order.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    pub fn advance_read(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.write_pos);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copies as much of `bytes` in as fits; returns the bytes taken.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let dst = self.write_slice();
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        self.advance_write(n);
        n
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}
