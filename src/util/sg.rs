//! Scatter/gather lists and block-wise traversal.
//!
//! A payload is an ordered sequence of byte regions. Both sides of the
//! transport operate on these lists: the target fills them from pool
//! buffers or in-capsule data, the protection-information engine walks
//! them block by block, and the verbs layer turns them into SGEs.

use crate::util::dma::DmaBuf;

/// One contiguous region of a scatter/gather payload.
#[derive(Debug, Clone)]
pub struct SgEntry {
    buf: DmaBuf,
    offset: usize,
    len: usize,
}

impl SgEntry {
    /// A view of `len` bytes starting `offset` bytes into `buf`.
    pub fn new(buf: DmaBuf, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= buf.len());
        Self { buf, offset, len }
    }

    /// A view covering all of `buf`.
    pub fn whole(buf: DmaBuf) -> Self {
        let len = buf.len();
        Self {
            buf,
            offset: 0,
            len,
        }
    }

    /// Virtual address of the first byte of this region.
    pub fn addr(&self) -> u64 {
        self.buf.base() + self.offset as u64
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying buffer.
    pub fn buf(&self) -> &DmaBuf {
        &self.buf
    }

    /// Offset of this region within its buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read bytes relative to the start of the region.
    pub fn read_at(&self, off: usize, out: &mut [u8]) {
        debug_assert!(off + out.len() <= self.len);
        self.buf.read_at(self.offset + off, out);
    }

    /// Write bytes relative to the start of the region.
    pub fn write_at(&self, off: usize, data: &[u8]) {
        debug_assert!(off + data.len() <= self.len);
        self.buf.write_at(self.offset + off, data);
    }

    /// Run `f` over an immutable window relative to the region start.
    pub fn with<R>(&self, off: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        debug_assert!(off + len <= self.len);
        self.buf.with(self.offset + off, len, f)
    }

    /// Run `f` over a mutable window relative to the region start.
    pub fn with_mut<R>(&self, off: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(off + len <= self.len);
        self.buf.with_mut(self.offset + off, len, f)
    }
}

/// Total byte length of a scatter/gather list.
pub fn total_len(iovs: &[SgEntry]) -> usize {
    iovs.iter().map(|e| e.len()).sum()
}

/// Copy between a scatter/gather list and a contiguous buffer.
///
/// Copies `min(total_len(iovs), buf.len())` bytes. `to_buf` selects the
/// direction: `true` gathers from the list into `buf`, `false` scatters
/// from `buf` into the list. Returns the number of bytes copied.
pub fn copy_buf(iovs: &[SgEntry], buf: &mut [u8], to_buf: bool) -> usize {
    let mut copied = 0;
    for iov in iovs {
        if copied >= buf.len() {
            break;
        }
        let len = iov.len().min(buf.len() - copied);
        if to_buf {
            iov.read_at(0, &mut buf[copied..copied + len]);
        } else {
            iov.write_at(0, &buf[copied..copied + len]);
        }
        copied += len;
    }
    copied
}

/// Check that every region's address is aligned to `alignment` bytes.
pub fn is_aligned(iovs: &[SgEntry], alignment: u64) -> bool {
    if alignment <= 1 {
        return true;
    }
    iovs.iter().all(|iov| iov.addr() & (alignment - 1) == 0)
}

/// Check that every region's length is a whole multiple of `granularity`.
pub fn has_granularity(iovs: &[SgEntry], granularity: usize) -> bool {
    iovs.iter().all(|iov| iov.len() % granularity == 0)
}

/// A cursor over a scatter/gather list, advancing by caller-chosen steps.
///
/// The cursor tracks the current region index and a byte offset within it.
/// Advancing may cross into the following region.
pub struct SgCursor<'a> {
    iovs: &'a [SgEntry],
    pos: usize,
    offset: usize,
}

impl<'a> SgCursor<'a> {
    /// A cursor positioned at the start of the list.
    pub fn new(iovs: &'a [SgEntry]) -> Self {
        Self {
            iovs,
            pos: 0,
            offset: 0,
        }
    }

    /// Whether any bytes remain.
    pub fn has_remaining(&self) -> bool {
        self.pos < self.iovs.len()
    }

    /// The current region, and how many contiguous bytes remain in it.
    pub fn current(&self) -> Option<(&SgEntry, usize, usize)> {
        let iov = self.iovs.get(self.pos)?;
        Some((iov, self.offset, iov.len() - self.offset))
    }

    /// Advance by `step` bytes, crossing region boundaries as needed.
    pub fn advance(&mut self, mut step: usize) {
        while step > 0 && self.pos < self.iovs.len() {
            let remain = self.iovs[self.pos].len() - self.offset;
            if step < remain {
                self.offset += step;
                return;
            }
            step -= remain;
            self.pos += 1;
            self.offset = 0;
        }
    }

    /// Gather up to `out.len()` bytes from the cursor position, advancing
    /// past them. Returns the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut done = 0;
        while done < out.len() {
            let Some((iov, off, remain)) = self.current() else {
                break;
            };
            let take = remain.min(out.len() - done);
            iov.read_at(off, &mut out[done..done + take]);
            done += take;
            self.advance(take);
        }
        done
    }

    /// Scatter `data` starting at the cursor position, advancing past it.
    /// Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            let Some((iov, off, remain)) = self.current() else {
                break;
            };
            let take = remain.min(data.len() - done);
            iov.write_at(off, &data[done..done + take]);
            done += take;
            self.advance(take);
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sgl(lens: &[usize]) -> Vec<SgEntry> {
        lens.iter()
            .map(|&l| SgEntry::whole(DmaBuf::alloc(l)))
            .collect()
    }

    #[test]
    fn test_copy_gather_scatter() {
        let iovs = make_sgl(&[3, 5, 4]);
        let data: Vec<u8> = (0u8..12).collect();
        let mut src = data.clone();
        assert_eq!(copy_buf(&iovs, &mut src, false), 12);

        let mut out = vec![0u8; 12];
        assert_eq!(copy_buf(&iovs, &mut out, true), 12);
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_stops_at_shorter_side() {
        let iovs = make_sgl(&[8]);
        let mut buf = vec![0xFFu8; 4];
        assert_eq!(copy_buf(&iovs, &mut buf, false), 4);
        let mut out = vec![0u8; 16];
        assert_eq!(copy_buf(&iovs, &mut out, true), 8);
    }

    #[test]
    fn test_granularity_predicate() {
        assert!(has_granularity(&make_sgl(&[512, 1024]), 512));
        assert!(!has_granularity(&make_sgl(&[512, 100]), 512));
    }

    #[test]
    fn test_alignment_predicate() {
        let iovs = make_sgl(&[4096]);
        assert!(is_aligned(&iovs, 1));
        // The DMA allocator hands out 4 KiB aligned bases.
        assert!(is_aligned(&iovs, 4096));
    }

    #[test]
    fn test_cursor_crosses_boundaries() {
        let iovs = make_sgl(&[3, 5]);
        let mut cur = SgCursor::new(&iovs);
        cur.write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut cur = SgCursor::new(&iovs);
        cur.advance(2);
        let mut out = [0u8; 3];
        assert_eq!(cur.read(&mut out), 3);
        assert_eq!(out, [3, 4, 5]);
        cur.advance(100);
        assert!(!cur.has_remaining());
    }
}
