//! The on-disk dump header.
//!
//! Every offset in a dump is relative to the start of the file, so a dump
//! is self-describing and can be loaded at an arbitrary base address —
//! only the fixed-size header needs to be read before the file can be
//! mapped and relocated. The header is coupled to exactly the binary that
//! produced it: there's no attempt at cross-binary portability, so
//! alignment and endianness are whatever the producing host used.

use std::io::{Read, Write};

use crate::value::LayoutDescriptor;

pub const MAGIC_LEN: usize = 16;

/// Worst-case page size across the portable targets this format addresses.
/// `cold_start` is always a multiple of this, regardless of the host's
/// actual page size, so a dump built on a 4 KiB-page host still maps
/// cleanly on a 64 KiB-page one.
pub const WORST_CASE_PAGE_SIZE: i32 = 65536;

/// The first 14 bytes of a well-formed dump's magic; the remaining two
/// are reserved and zero.
const MAGIC_TEXT: &[u8; 14] = b"PDUMPCOREDUMP!";

/// Marks a dump whose write was interrupted: the writer flips the first
/// magic byte to this before starting and only restores it after every
/// section and the header itself have been flushed, so a crash mid-write
/// leaves a file a loader can positively identify and reject rather than
/// silently mis-load.
const INCOMPLETE_MARKER: u8 = b'!';

/// A build-identity tag: two binaries must carry matching fingerprints
/// to share a dump. Derived from the host's [`LayoutDescriptor`] digest
/// plus the crate version, so a dump is refused both when the host's
/// field layouts changed and when `pdump-core` itself was rebuilt against
/// an incompatible writer/loader pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn compute(layout: &LayoutDescriptor, crate_version: &str) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&layout.digest());
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in crate_version.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        bytes[8..16].copy_from_slice(&hash.to_le_bytes());
        Fingerprint(bytes)
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Offset and entry count of one relocation or object-starts table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableLocator {
    pub offset: i32,
    pub entry_count: i32,
}

/// The fixed-size header every dump file begins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    pub magic: [u8; MAGIC_LEN],
    pub fingerprint: Fingerprint,
    /// One relocation table locator per [`crate::reloc::RelocPhase`].
    pub dump_relocs: [TableLocator; 3],
    pub object_starts: TableLocator,
    pub emacs_relocs: TableLocator,
    /// Start of the sub-region that can be discarded from memory once
    /// every relocation hook has run: objects copied wholesale into the
    /// host image at load and are never read from the dump again.
    pub discardable_start: i32,
    /// Start of the cold region — page-aligned, never relocated,
    /// mappable directly from the backing file.
    pub cold_start: i32,
    /// Offset of the vector of dumped hash tables, read back by the host
    /// after load to re-register them.
    pub hash_list: i32,
}

impl DumpHeader {
    pub const ENCODED_LEN: usize = MAGIC_LEN + 16 + 3 * 8 + 8 + 8 + 4 + 4 + 4;

    pub fn new(fingerprint: Fingerprint) -> Self {
        let mut magic = [0u8; MAGIC_LEN];
        magic[..MAGIC_TEXT.len()].copy_from_slice(MAGIC_TEXT);
        DumpHeader {
            magic,
            fingerprint,
            dump_relocs: [TableLocator::default(); 3],
            object_starts: TableLocator::default(),
            emacs_relocs: TableLocator::default(),
            discardable_start: 0,
            cold_start: 0,
            hash_list: 0,
        }
    }

    /// Flip the first magic byte to mark the dump incomplete. Call before
    /// writing the header for the first time; call [`Self::mark_complete`]
    /// only after every section has been flushed to disk.
    pub fn mark_incomplete(&mut self) {
        self.magic[0] = INCOMPLETE_MARKER;
    }

    pub fn mark_complete(&mut self) {
        self.magic[0] = MAGIC_TEXT[0];
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(&self.fingerprint.0);
        for locator in &self.dump_relocs {
            out.extend_from_slice(&locator.offset.to_le_bytes());
            out.extend_from_slice(&locator.entry_count.to_le_bytes());
        }
        for locator in [self.object_starts, self.emacs_relocs] {
            out.extend_from_slice(&locator.offset.to_le_bytes());
            out.extend_from_slice(&locator.entry_count.to_le_bytes());
        }
        out.extend_from_slice(&self.discardable_start.to_le_bytes());
        out.extend_from_slice(&self.cold_start.to_le_bytes());
        out.extend_from_slice(&self.hash_list.to_le_bytes());
        out
    }

    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Reports the state of the magic string without yet checking the
    /// fingerprint: `Ok(true)` for a complete dump, `Ok(false)` for one
    /// the writer never finished, `Err` for a file that isn't a dump at
    /// all.
    pub fn parse(bytes: &[u8]) -> Result<(Self, bool), HeaderParseError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(HeaderParseError::TooShort);
        }
        let mut magic = [0u8; MAGIC_LEN];
        magic.copy_from_slice(&bytes[0..MAGIC_LEN]);

        let mut complete = true;
        let mut candidate = magic;
        if candidate[0] == INCOMPLETE_MARKER {
            candidate[0] = MAGIC_TEXT[0];
            complete = false;
        }
        if candidate[..MAGIC_TEXT.len()] != MAGIC_TEXT[..] {
            return Err(HeaderParseError::BadMagic);
        }

        let mut fingerprint = [0u8; 16];
        fingerprint.copy_from_slice(&bytes[MAGIC_LEN..MAGIC_LEN + 16]);

        let mut cursor = MAGIC_LEN + 16;
        let mut read_i32 = |bytes: &[u8], cursor: &mut usize| {
            let v = i32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
            *cursor += 4;
            v
        };
        let mut dump_relocs = [TableLocator::default(); 3];
        for slot in &mut dump_relocs {
            slot.offset = read_i32(bytes, &mut cursor);
            slot.entry_count = read_i32(bytes, &mut cursor);
        }
        let mut object_starts = TableLocator::default();
        object_starts.offset = read_i32(bytes, &mut cursor);
        object_starts.entry_count = read_i32(bytes, &mut cursor);
        let mut emacs_relocs = TableLocator::default();
        emacs_relocs.offset = read_i32(bytes, &mut cursor);
        emacs_relocs.entry_count = read_i32(bytes, &mut cursor);
        let discardable_start = read_i32(bytes, &mut cursor);
        let cold_start = read_i32(bytes, &mut cursor);
        let hash_list = read_i32(bytes, &mut cursor);

        Ok((
            DumpHeader {
                magic,
                fingerprint: Fingerprint(fingerprint),
                dump_relocs,
                object_starts,
                emacs_relocs,
                discardable_start,
                cold_start,
                hash_list,
            },
            complete,
        ))
    }

    pub fn read_from(mut r: impl Read) -> Result<(Self, bool), HeaderParseError> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        r.read_exact(&mut buf).map_err(|_| HeaderParseError::TooShort)?;
        Self::parse(&buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParseError {
    TooShort,
    BadMagic,
}

/// Round `value` up to the next multiple of `page_size`. The cold
/// section always starts on a page boundary so it can be mapped directly
/// from the backing file.
pub fn round_up_to_page(value: i32, page_size: i32) -> i32 {
    let page_size = page_size as i64;
    let value = value as i64;
    (((value + page_size - 1) / page_size) * page_size) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> DumpHeader {
        let fp = Fingerprint::compute(
            &LayoutDescriptor {
                type_layouts: vec!["Cons: 16 bytes".into()],
            },
            "0.1.0",
        );
        let mut header = DumpHeader::new(fp);
        header.dump_relocs[0] = TableLocator {
            offset: 64,
            entry_count: 3,
        };
        header.object_starts = TableLocator {
            offset: 128,
            entry_count: 10,
        };
        header.discardable_start = 4096;
        header.cold_start = 65536;
        header
    }

    #[test]
    fn encode_parse_roundtrip() {
        let header = sample_header();
        let bytes = header.encode();
        let (parsed, complete) = DumpHeader::parse(&bytes).unwrap();
        assert!(complete);
        assert_eq!(parsed, header);
    }

    #[test]
    fn incomplete_marker_is_detected_and_restored() {
        let mut header = sample_header();
        header.mark_incomplete();
        let bytes = header.encode();
        let (parsed, complete) = DumpHeader::parse(&bytes).unwrap();
        assert!(!complete);
        assert_eq!(parsed.magic[0], MAGIC_TEXT[0]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut header = sample_header();
        header.magic[1] = b'X';
        let bytes = header.encode();
        assert_eq!(DumpHeader::parse(&bytes), Err(HeaderParseError::BadMagic));
    }

    #[test]
    fn cold_start_rounds_up_to_page_size() {
        assert_eq!(round_up_to_page(1, 65536), 65536);
        assert_eq!(round_up_to_page(65536, 65536), 65536);
        assert_eq!(round_up_to_page(65537, 65536), 131072);
    }
}
