//! Bit-packed relocation records.
//!
//! `DumpReloc` patches a slot inside the dump once it has been mapped at
//! its runtime base; `EmacsReloc` patches a slot in the host binary's data
//! segment from dump contents. Both are packed into fixed-width words so
//! the on-disk relocation tables stay small and cheap to binary-search.

use crate::value::{DumpOff, HostOff, Tag};

/// Alignment granularity baked into `DumpReloc`'s packed offset.
pub const DUMP_RELOC_ALIGNMENT: u32 = 4;

/// Which of the three ordered passes a relocation belongs to.
///
/// Applied in this order on load, with hook lists firing after `Early` and
/// after `VeryLate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelocPhase {
    Early,
    Late,
    VeryLate,
}

impl RelocPhase {
    pub const ALL: [RelocPhase; 3] = [RelocPhase::Early, RelocPhase::Late, RelocPhase::VeryLate];

    pub fn index(self) -> usize {
        match self {
            RelocPhase::Early => 0,
            RelocPhase::Late => 1,
            RelocPhase::VeryLate => 2,
        }
    }
}

/// A single in-dump relocation.
///
/// Packed as `raw_offset << 5 | type` (5 type bits, 27 offset bits scaled
/// by [`DUMP_RELOC_ALIGNMENT`]); [`DumpReloc::pack`]/[`DumpReloc::unpack`]
/// are the only places that touch the packed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpReloc {
    pub kind: DumpRelocKind,
    pub offset: DumpOff,
}

/// Variant tag for a [`DumpReloc`].
///
/// `DumpToDumpLv`/`DumpToHostLv` carry the target [`Tag`] so the loader
/// can reconstruct a full tagged value, not just a raw pointer, after
/// relocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpRelocKind {
    DumpToHostPtr,
    DumpToDumpPtr,
    NativeCompUnit,
    NativeSubr,
    Bignum,
    DumpToDumpLv(Tag),
    DumpToHostLv(Tag),
}

impl DumpRelocKind {
    fn discriminant(self) -> u8 {
        match self {
            DumpRelocKind::DumpToHostPtr => 0,
            DumpRelocKind::DumpToDumpPtr => 1,
            DumpRelocKind::NativeCompUnit => 2,
            DumpRelocKind::NativeSubr => 3,
            DumpRelocKind::Bignum => 4,
            DumpRelocKind::DumpToDumpLv(tag) => 5 + tag as u8,
            DumpRelocKind::DumpToHostLv(tag) => 5 + Tag::COUNT as u8 + tag as u8,
        }
    }

    fn from_discriminant(d: u8) -> Option<Self> {
        Some(match d {
            0 => DumpRelocKind::DumpToHostPtr,
            1 => DumpRelocKind::DumpToDumpPtr,
            2 => DumpRelocKind::NativeCompUnit,
            3 => DumpRelocKind::NativeSubr,
            4 => DumpRelocKind::Bignum,
            d if (5..5 + Tag::COUNT as u8).contains(&d) => {
                DumpRelocKind::DumpToDumpLv(Tag::from_index(d - 5)?)
            }
            d if (5 + Tag::COUNT as u8..5 + 2 * Tag::COUNT as u8).contains(&d) => {
                DumpRelocKind::DumpToHostLv(Tag::from_index(d - 5 - Tag::COUNT as u8)?)
            }
            _ => return None,
        })
    }
}

impl DumpReloc {
    pub fn pack(self) -> u32 {
        let scaled = (self.offset as u32) / DUMP_RELOC_ALIGNMENT;
        debug_assert_eq!(
            scaled * DUMP_RELOC_ALIGNMENT,
            self.offset as u32,
            "dump relocation out of range"
        );
        (scaled << 5) | u32::from(self.kind.discriminant())
    }

    pub fn unpack(word: u32) -> Option<Self> {
        let kind = DumpRelocKind::from_discriminant((word & 0x1f) as u8)?;
        let offset = ((word >> 5) * DUMP_RELOC_ALIGNMENT) as DumpOff;
        Some(DumpReloc { kind, offset })
    }
}

/// Variant tag for an [`EmacsReloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmacsRelocKind {
    /// Copy bytes from the dump into the host image. `length` is a byte
    /// count.
    CopyFromDump,
    /// Write bytes of an inline immediate payload. `length` is a byte
    /// count.
    Immediate,
    /// Write a dump-relative raw pointer, adjusted to the runtime base.
    /// `length` is always the machine word size.
    DumpPtrRaw,
    /// Write a pointer to somewhere else in the host image. `length` is
    /// always the machine word size.
    HostPtrRaw,
    /// Compose a tagged value pointing into the dump; `length` carries
    /// the value's [`Tag`], not a byte count.
    DumpLv,
    /// Compose a tagged value pointing into the host image; `length`
    /// carries the value's [`Tag`], not a byte count.
    HostLv,
}

/// One entry in the host-relocation table.
///
/// `length` is overloaded: a byte count for
/// `CopyFromDump`/`Immediate`/`*PtrRaw`, the numeric [`Tag`] discriminant
/// for `DumpLv`/`HostLv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmacsReloc {
    pub kind: EmacsRelocKind,
    pub length: u32,
    pub host_offset: HostOff,
    pub payload: EmacsRelocPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmacsRelocPayload {
    DumpOffset(DumpOff),
    HostOffset(HostOff),
    /// Up to 8 bytes of inline immediate data plus how many are valid.
    Immediate([u8; 8], u8),
}

impl EmacsReloc {
    pub fn tag(&self) -> Option<Tag> {
        matches!(self.kind, EmacsRelocKind::DumpLv | EmacsRelocKind::HostLv)
            .then(|| Tag::from_index(self.length as u8))
            .flatten()
    }

    pub fn dump_offset(&self) -> Option<DumpOff> {
        match self.payload {
            EmacsRelocPayload::DumpOffset(o) => Some(o),
            _ => None,
        }
    }
}

/// Merge adjacent `CopyFromDump` relocations whose source and destination
/// ranges are both contiguous into a single, larger copy.
///
/// `relocs` must already be sorted by `host_offset` ascending (the order
/// the emacs-reloc table is emitted in). Non-`CopyFromDump` entries pass
/// through untouched and break the merge run.
pub fn merge_copy_from_dump(relocs: Vec<EmacsReloc>) -> Vec<EmacsReloc> {
    let mut merged: Vec<EmacsReloc> = Vec::with_capacity(relocs.len());
    for reloc in relocs {
        if reloc.kind == EmacsRelocKind::CopyFromDump {
            if let Some(last) = merged.last_mut() {
                if last.kind == EmacsRelocKind::CopyFromDump {
                    let dump_contig =
                        last.dump_offset().unwrap() + last.length as DumpOff == reloc.dump_offset().unwrap();
                    let host_contig = last.host_offset + last.length as HostOff == reloc.host_offset;
                    if dump_contig && host_contig {
                        last.length += reloc.length;
                        continue;
                    }
                }
            }
        }
        merged.push(reloc);
    }
    merged
}
