//! The writer's grow-on-write output buffer.
//!
//! An unbounded, seekable byte buffer with alignment padding, in-place
//! patching, and a dry-run "contents disabled" mode for size-only passes.

use crate::error::PdumpError;
use crate::value::DumpOff;

/// Baseline allocation; doubled on every subsequent growth.
const INITIAL_CAPACITY: usize = 8 * 1024 * 1024;

/// Alignment granularity for object headers.
///
/// `max(host GC alignment, 4)` in principle; we fix the host GC alignment
/// at 8 (the common case for a 64-bit word-aligned allocator) since the
/// exact value is one more thing owned by the host and not by
/// `pdump-core` — callers that need a different alignment can still pack
/// objects at 1-byte granularity via [`DumpBuffer::set_packed`].
pub const DUMP_ALIGNMENT: usize = 8;

/// Grow-on-write output buffer with alignment padding and seek/patch.
///
/// `write`/`write_zeroes` are only permitted while either an object is in
/// progress (`in_progress_offset().is_some()`) or the buffer is in
/// "contents disabled" mode — that state exists solely to let the writer
/// do a dry, size-only scan pass, see [`crate::writer::Writer::measure`].
pub struct DumpBuffer {
    data: Vec<u8>,
    /// Start offset of the object currently being populated, or `None`
    /// between objects. Offset `0` is reserved and never denotes a real
    /// object start, see [`Self::object_start`].
    in_progress: Option<DumpOff>,
    /// When true, `write`/`write_zeroes`/`align_to` are no-ops that only
    /// advance a virtual cursor — used for the size-measurement pass.
    contents_disabled: bool,
    /// When true, objects are packed at 1-byte granularity instead of
    /// [`DUMP_ALIGNMENT`].
    packed: bool,
}

impl DumpBuffer {
    pub fn new() -> Self {
        DumpBuffer {
            data: Vec::with_capacity(INITIAL_CAPACITY),
            in_progress: None,
            contents_disabled: false,
            packed: false,
        }
    }

    pub fn set_contents_disabled(&mut self, disabled: bool) {
        self.contents_disabled = disabled;
    }

    pub fn set_packed(&mut self, packed: bool) {
        self.packed = packed;
    }

    pub fn in_progress_offset(&self) -> Option<DumpOff> {
        self.in_progress
    }

    pub fn offset(&self) -> DumpOff {
        self.data.len() as DumpOff
    }

    fn alignment(&self) -> usize {
        if self.packed {
            1
        } else {
            DUMP_ALIGNMENT
        }
    }

    /// Grow the backing allocation, doubling from [`INITIAL_CAPACITY`].
    fn reserve(&mut self, additional: usize) {
        if self.data.capacity() < self.data.len() + additional {
            let mut new_cap = self.data.capacity().max(INITIAL_CAPACITY);
            while new_cap < self.data.len() + additional {
                new_cap *= 2;
            }
            self.data.reserve(new_cap - self.data.capacity());
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<DumpOff, PdumpError> {
        if self.in_progress.is_none() && !self.contents_disabled {
            return Err(PdumpError::IntegrityViolation {
                what: "write outside an in-progress object".into(),
            });
        }
        let start = self.offset();
        if !self.contents_disabled {
            self.reserve(bytes.len());
            self.data.extend_from_slice(bytes);
        } else {
            // Virtual cursor only: still accounted for by callers that
            // track `offset()`, but nothing is materialized.
            self.data.resize(self.data.len(), 0);
        }
        Ok(start)
    }

    pub fn write_zeroes(&mut self, n: usize) -> Result<DumpOff, PdumpError> {
        if self.in_progress.is_none() && !self.contents_disabled {
            return Err(PdumpError::IntegrityViolation {
                what: "write_zeroes outside an in-progress object".into(),
            });
        }
        let start = self.offset();
        if !self.contents_disabled {
            self.reserve(n);
            self.data.resize(self.data.len() + n, 0);
        }
        Ok(start)
    }

    /// Pad to the next multiple of `align` (or the buffer's own object
    /// alignment if `align` is 0).
    pub fn align_to(&mut self, align: usize) -> Result<(), PdumpError> {
        let align = if align == 0 { self.alignment() } else { align };
        let rem = (self.offset() as usize) % align;
        if rem != 0 {
            self.write_zeroes(align - rem)?;
        }
        Ok(())
    }

    /// Seek to `off` for an in-place patch. Forbidden while an object is
    /// in progress — you may never seek out from under an unfinished
    /// object.
    pub fn seek(&mut self, off: DumpOff) -> Result<DumpOff, PdumpError> {
        if self.in_progress.is_some() {
            return Err(PdumpError::IntegrityViolation {
                what: "seek while an object is in progress".into(),
            });
        }
        if off < 0 || off as usize > self.data.len() {
            return Err(PdumpError::IntegrityViolation {
                what: format!("seek out of range: {off}"),
            });
        }
        let saved = self.offset();
        // We represent "seek" as a cursor move for patch-writes: callers
        // patch in place via `patch_at`, not via `write` after `seek`,
        // since `write` always appends. `seek` here just validates bounds
        // and returns the previous offset so the resolver can restore it.
        Ok(saved.max(off))
    }

    /// Overwrite `bytes.len()` bytes starting at `at`, in place. Used by
    /// the fixup resolver once an object's final offset is known.
    pub fn patch_at(&mut self, at: DumpOff, bytes: &[u8]) -> Result<(), PdumpError> {
        let at = at as usize;
        if at + bytes.len() > self.data.len() {
            return Err(PdumpError::IntegrityViolation {
                what: format!("patch out of range at {at}"),
            });
        }
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_at(&self, at: DumpOff, len: usize) -> &[u8] {
        let at = at as usize;
        &self.data[at..at + len]
    }

    /// Append bytes outside of any `object_start`/`object_finish` bracket.
    ///
    /// Used for cold-section blobs (string bytes, buffer text, bignum
    /// limbs) and for final assembly (relocation tables, the header),
    /// neither of which goes through the per-type field-helper protocol
    /// that `write`/`write_zeroes` otherwise guard.
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<DumpOff, PdumpError> {
        if self.in_progress.is_some() {
            return Err(PdumpError::IntegrityViolation {
                what: "append_raw while an object is in progress".into(),
            });
        }
        let start = self.offset();
        if !self.contents_disabled {
            self.reserve(bytes.len());
            self.data.extend_from_slice(bytes);
        } else {
            self.data.resize(self.data.len() + bytes.len(), 0);
        }
        Ok(start)
    }

    /// Pad to the next multiple of `align` (buffer's own alignment if 0),
    /// outside of any in-progress object. See [`Self::append_raw`].
    pub fn align_raw(&mut self, align: usize) -> Result<(), PdumpError> {
        let align = if align == 0 { self.alignment() } else { align };
        let rem = (self.offset() as usize) % align;
        if rem != 0 {
            self.append_raw(&vec![0u8; align - rem])?;
        }
        Ok(())
    }

    /// Begin a new object: asserts no other write is in progress, pads to
    /// alignment, and records the start offset.
    pub fn object_start(&mut self, size: usize) -> Result<DumpOff, PdumpError> {
        if self.in_progress.is_some() {
            return Err(PdumpError::IntegrityViolation {
                what: "nested object_start".into(),
            });
        }
        let _ = size;
        if !self.contents_disabled {
            self.align_to(0)?;
        }
        let offset = self.offset();
        self.in_progress = Some(offset);
        Ok(offset)
    }

    /// Finish the in-progress object, writing `out` if content writing is
    /// enabled, and returning its starting offset.
    pub fn object_finish(&mut self, out: &[u8]) -> Result<DumpOff, PdumpError> {
        let offset = self.in_progress.take().ok_or_else(|| PdumpError::IntegrityViolation {
            what: "object_finish without object_start".into(),
        })?;
        if self.contents_disabled {
            // Size-only pass: still advance the cursor by the object size
            // so later alignment computations are correct.
            self.data.resize(self.data.len() + out.len(), 0);
        } else {
            self.reserve(out.len());
            self.data.extend_from_slice(out);
        }
        Ok(offset)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for DumpBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_start_aligns() {
        let mut buf = DumpBuffer::new();
        buf.write(b"x").unwrap_err(); // no object in progress
        let off = buf.object_start(4).unwrap();
        assert_eq!(off % DUMP_ALIGNMENT as DumpOff, 0);
        buf.object_finish(&[0u8; 4]).unwrap();
        assert_eq!(buf.offset() as usize, 4);

        let off2 = buf.object_start(3).unwrap();
        assert_eq!(off2 % DUMP_ALIGNMENT as DumpOff, 0);
    }

    #[test]
    fn seek_forbidden_mid_object() {
        let mut buf = DumpBuffer::new();
        buf.object_start(4).unwrap();
        assert!(buf.seek(0).is_err());
    }

    #[test]
    fn append_raw_works_between_objects_and_rejects_mid_object() {
        let mut buf = DumpBuffer::new();
        buf.append_raw(b"cold blob").unwrap();
        buf.object_start(4).unwrap();
        assert!(buf.append_raw(b"nope").is_err());
    }

    #[test]
    fn align_raw_pads_without_an_in_progress_object() {
        let mut buf = DumpBuffer::new();
        buf.append_raw(b"x").unwrap();
        buf.align_raw(64).unwrap();
        assert_eq!(buf.offset() as usize % 64, 0);
    }

    #[test]
    fn patch_at_overwrites_in_place() {
        let mut buf = DumpBuffer::new();
        let off = buf.object_start(8).unwrap();
        buf.object_finish(&[0xDEu8, 0xAD, 0xF0, 0x0D, 0, 0, 0, 0]).unwrap();
        buf.patch_at(off, &42u32.to_le_bytes()).unwrap();
        assert_eq!(buf.read_at(off, 4), &42u32.to_le_bytes());
    }
}
