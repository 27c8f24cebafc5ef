use std::cmp;
use std::io::{self, Read};

/// A fixed-capacity receive buffer.
///
/// Unread bytes occupy `pos..present`. Space is reclaimed by compaction, which moves
/// the unread run to the front of the buffer without changing its contents.
#[derive(Debug)]
pub struct RecvBuffer {
    bytes: Box<[u8]>,
    present: usize,
    pos: usize,
}

impl RecvBuffer {
    /// ## Panics
    ///
    /// This function panics if `capacity` is zero.
    pub fn new(capacity: usize) -> RecvBuffer {
        assert!(capacity > 0, "receive buffer capacity must be non-zero");
        RecvBuffer {
            bytes: vec![0; capacity].into_boxed_slice(),
            present: 0,
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Compaction is triggered once the read cursor passes this offset.
    pub fn water_mark(&self) -> usize {
        self.capacity() / 2
    }

    /// The number of unread bytes.
    pub fn len(&self) -> usize {
        self.present - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.present
    }

    /// Space after the last unread byte.
    pub fn free(&self) -> usize {
        self.capacity() - self.present
    }

    #[cfg(test)]
    pub fn cursors(&self) -> (usize, usize) {
        (self.pos, self.present)
    }

    /// Reclaims consumed space before a read.
    pub fn compact_for_read(&mut self) {
        if self.pos >= self.present {
            self.pos = 0;
            self.present = 0;
        } else if self.pos >= self.water_mark() {
            self.compact();
        }
    }

    /// Reclaims consumed space if `len` bytes would not otherwise fit.
    pub fn compact_for_write(&mut self, len: usize) {
        if self.pos > 0 && self.free() < len {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let (pos, present) = (self.pos, self.present);
        self.bytes.copy_within(pos..present, 0);
        self.present = present - pos;
        self.pos = 0;
    }

    /// Reads exactly `len` bytes from `src` into the free space.
    ///
    /// ## Panics
    ///
    /// This function panics if `len` exceeds the free space; callers check `free` first.
    pub fn fill_from<R: Read>(&mut self, len: usize, src: &mut R) -> io::Result<()> {
        let end = self.present + len;
        src.read_exact(&mut self.bytes[self.present..end])?;
        self.present = end;
        Ok(())
    }

    /// Copies as many unread bytes as fit into `dst` and returns the count.
    ///
    /// When the unread run is consumed entirely both cursors are reset.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let sz = cmp::min(dst.len(), self.len());
        dst[..sz].copy_from_slice(&self.bytes[self.pos..self.pos + sz]);
        self.pos += sz;
        if self.pos >= self.present {
            self.pos = 0;
            self.present = 0;
        }
        sz
    }
}
