//! Scatter output coder (`spec.md` §4.6). The C original keeps a fixed
//! array of up to 32 segments (inline bytes or an externally-pinned
//! pointer) plus a dispose chain of up to 32 `(fn, arg1, arg2)` entries
//! run on `dispose_output`. Rust ownership already solves the "pin this
//! external memory until flush" problem that the dispose chain exists
//! for, so here a [`Coder`] is a small growable list of owned or shared
//! byte segments, and the dispose chain is a list of `FnOnce` closures
//! rather than raw function-pointer/argument pairs.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{WireError, WireResult};

/// Matches the original's fixed-size tables; exceeding either is a
/// coder bug, not a runtime condition callers are expected to recover
/// from gracefully, so it surfaces as [`WireError::CoderFull`].
pub const MAX_SEGMENTS: usize = 32;
pub const MAX_DISPOSERS: usize = 32;

enum Segment {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl Segment {
    fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Owned(v) => v.as_slice(),
            Segment::Shared(s) => s.as_ref(),
        }
    }

    fn len(&self) -> u32 {
        self.as_slice().len() as u32
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// A scatter output buffer: `write`/`write_copy`/the integer writers
/// append to it, `write_subcoder` splices another coder's bytes in
/// without re-copying them on every later flush, and `get_position`/
/// `set_position` let a caller back-patch a length prefix once the
/// real length is known.
pub struct Coder {
    segments: SmallVec<[Segment; 8]>,
    disposers: SmallVec<[Disposer; 4]>,
    pos: u32,
    total_len: u32,
}

impl Default for Coder {
    fn default() -> Self {
        Self::new()
    }
}

impl Coder {
    #[must_use]
    pub fn new() -> Self {
        Coder {
            segments: SmallVec::new(),
            disposers: SmallVec::new(),
            pos: 0,
            total_len: 0,
        }
    }

    #[must_use]
    pub fn get_position(&self) -> u32 {
        self.pos
    }

    /// Moves the write cursor. Moving past the current end pads with
    /// zeroes lazily, on the next write; moving backward allows a
    /// later write to patch bytes already emitted.
    pub fn set_position(&mut self, pos: u32) -> WireResult<()> {
        self.pos = pos;
        Ok(())
    }

    fn push_segment(&mut self, seg: Segment) -> WireResult<()> {
        if self.segments.len() >= MAX_SEGMENTS {
            return Err(WireError::CoderFull);
        }
        self.total_len += seg.len();
        self.segments.push(seg);
        Ok(())
    }

    /// Locates the owned segment and in-segment offset covering
    /// `self.pos`, for patching previously written bytes. Returns
    /// `None` if `pos` falls inside a `Shared` (externally pinned)
    /// segment, which cannot be patched in place.
    fn locate_owned_mut(&mut self, len: u32) -> Option<(usize, usize)> {
        let mut base = 0u32;
        for (i, seg) in self.segments.iter().enumerate() {
            let seg_len = seg.len();
            if self.pos >= base && self.pos + len <= base + seg_len {
                return match seg {
                    Segment::Owned(_) => Some((i, (self.pos - base) as usize)),
                    Segment::Shared(_) => None,
                };
            }
            base += seg_len;
        }
        None
    }

    fn append_tail(&mut self, bytes: &[u8]) -> WireResult<()> {
        if let Some(Segment::Owned(tail)) = self.segments.last_mut() {
            tail.extend_from_slice(bytes);
            self.total_len += bytes.len() as u32;
            return Ok(());
        }
        self.push_segment(Segment::Owned(bytes.to_vec()))
    }

    /// Writes `bytes`, copying them into the coder's own storage.
    /// `write` and `write_copy` coincide in this owned-buffer model;
    /// the zero-copy path is [`Coder::write_subcoder`].
    pub fn write(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.write_copy(bytes)
    }

    pub fn write_copy(&mut self, bytes: &[u8]) -> WireResult<()> {
        if self.pos < self.total_len {
            let len = bytes.len() as u32;
            if let Some((idx, offset)) = self.locate_owned_mut(len) {
                if let Segment::Owned(buf) = &mut self.segments[idx] {
                    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
                    self.pos += len;
                    return Ok(());
                }
            }
            return Err(WireError::Malformed);
        }
        if self.pos > self.total_len {
            let pad = (self.pos - self.total_len) as usize;
            self.append_tail(&vec![0u8; pad])?;
        }
        self.append_tail(bytes)?;
        self.pos = self.total_len;
        Ok(())
    }

    pub fn write_zeroes(&mut self, count: u32) -> WireResult<()> {
        self.write_copy(&vec![0u8; count as usize])
    }

    /// Pads with zeroes until `get_position()` is a multiple of `base`
    /// (`base` must be a power of two).
    pub fn write_align(&mut self, base: u32) -> WireResult<()> {
        self.write_align_at(base, 0)
    }

    /// As [`Coder::write_align`], but aligns `position - index` rather
    /// than `position` itself — for sub-structures that don't start at
    /// offset 0.
    pub fn write_align_at(&mut self, base: u32, index: u32) -> WireResult<()> {
        if base == 0 || (base & (base - 1)) != 0 {
            return Err(WireError::Malformed);
        }
        let rel = self.pos.wrapping_sub(index);
        let rem = rel % base;
        if rem != 0 {
            self.write_zeroes(base - rem)?;
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> WireResult<()> {
        self.write_copy(&[value])
    }

    pub fn write_u16le(&mut self, value: u16) -> WireResult<()> {
        self.write_copy(&value.to_le_bytes())
    }

    pub fn write_u16be(&mut self, value: u16) -> WireResult<()> {
        self.write_copy(&value.to_be_bytes())
    }

    pub fn write_u32le(&mut self, value: u32) -> WireResult<()> {
        self.write_copy(&value.to_le_bytes())
    }

    pub fn write_u32be(&mut self, value: u32) -> WireResult<()> {
        self.write_copy(&value.to_be_bytes())
    }

    /// Splices `size` bytes starting at `offset` from `src` into this
    /// coder as a shared, reference-counted segment — the one place
    /// this coder avoids re-copying bytes on every later flush.
    pub fn write_subcoder(&mut self, src: &Coder, offset: u32, size: u32) -> WireResult<()> {
        let flat = src.flatten();
        let start = offset as usize;
        let end = start + size as usize;
        if end > flat.len() {
            return Err(WireError::Truncated);
        }
        let shared: Arc<[u8]> = Arc::from(&flat[start..end]);
        if self.pos != self.total_len {
            return self.write_copy(&flat[start..end]);
        }
        self.push_segment(Segment::Shared(shared))?;
        self.pos = self.total_len;
        Ok(())
    }

    fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len as usize);
        for seg in &self.segments {
            out.extend_from_slice(seg.as_slice());
        }
        out
    }

    /// Copies as much of the output as fits into `dst`, starting at
    /// offset 0, returning the number of bytes copied.
    #[must_use]
    pub fn output_get_buffer(&self, dst: &mut [u8]) -> usize {
        let flat = self.flatten();
        let n = flat.len().min(dst.len());
        dst[..n].copy_from_slice(&flat[..n]);
        n
    }

    /// Borrowed slices over each segment in order — this coder's
    /// equivalent of an iovec array, since no real syscall vector is
    /// involved.
    #[must_use]
    pub fn output_get_iovec(&self) -> Vec<&[u8]> {
        self.segments.iter().map(Segment::as_slice).collect()
    }

    #[must_use]
    pub fn output_len(&self) -> u32 {
        self.total_len
    }

    /// Registers a closure to run when [`Coder::dispose_output`] is
    /// called, or when the coder is dropped without having been
    /// explicitly disposed. Subsumes the original's two-argument
    /// variant, since a Rust closure already captures as many values
    /// as it needs.
    pub fn on_dispose_output(&mut self, f: impl FnOnce() + Send + 'static) -> WireResult<()> {
        if self.disposers.len() >= MAX_DISPOSERS {
            return Err(WireError::CoderFull);
        }
        self.disposers.push(Box::new(f));
        Ok(())
    }

    /// Runs and clears the dispose chain, in registration order.
    pub fn dispose_output(&mut self) {
        for f in self.disposers.drain(..) {
            f();
        }
    }
}

impl Drop for Coder {
    fn drop(&mut self) {
        self.dispose_output();
    }
}
