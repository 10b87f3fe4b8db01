//! Deferred patches resolved once every object's final offset is known.
//!
//! While the writer walks the heap it often needs to write a pointer to
//! an object it hasn't dumped yet (forward references, cycles through
//! cons cells, a hash table's buckets). Rather than block, it records a
//! [`Fixup`] describing where the patch goes and what it should resolve
//! to, and keeps writing. Once every reachable object has been dumped,
//! [`resolve_fixups`] walks the list in offset order and overwrites each
//! slot, possibly emitting a [`crate::reloc::DumpReloc`] alongside it.

use crate::buffer::DumpBuffer;
use crate::error::PdumpError;
use crate::reloc::{DumpReloc, DumpRelocKind};
use crate::remember::{RememberTable, RememberedOffset};
use crate::value::{DumpOff, HostOff, ObjectId, Tag};

/// What a pending patch should end up containing.
#[derive(Debug, Clone, Copy)]
pub enum FixupTarget {
    /// A tagged value pointing at `object`. Resolves to either a
    /// dump-to-host relocation (the object lives in the host's data
    /// segment) or a dump-to-dump relocation (anything already dumped).
    LispObject { object: ObjectId, tag: Tag },
    /// Same as `LispObject` but writes a raw pointer, not a tagged
    /// value — used for fields typed as a bare C pointer.
    LispObjectRaw { object: ObjectId },
    /// A raw pointer to a location already known to be at a fixed dump
    /// offset (no lookup needed).
    PtrDumpRaw { at: DumpOff },
    /// A raw pointer to the cold-section blob belonging to `owner`
    /// (string bytes, buffer text, a symbol's localized-value aux block),
    /// resolved once the cold section has been emitted and every blob has
    /// a final offset.
    ColdBytes { owner: ObjectId },
    /// Reload metadata for an arbitrary-precision integer's backing
    /// limb array, looked up by the object that owns it.
    BignumData { owner: ObjectId },
}

/// One outstanding patch: where it goes, and what should be written
/// there once resolved.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub at: DumpOff,
    pub target: FixupTarget,
}

/// Per-object host-residency and cold-blob lookups the resolver needs,
/// supplied by the caller instead of baked into this module (mirrors the
/// split `TypeOracle` already owns for everything else).
pub trait FixupOracle {
    /// `Some(host_offset)` when `object` lives in the host binary's data
    /// segment rather than the dump (builtin symbols, primitive subrs,
    /// objects on the copied-to-host deferred queue).
    fn host_resident_offset(&self, object: ObjectId) -> Option<HostOff>;
    fn cold_bytes_offset(&self, object: ObjectId) -> Option<DumpOff>;
    fn bignum_reload_info(&self, object: ObjectId) -> Option<(DumpOff, u32)>;
}

/// Resolve every queued fixup against `buffer`, sorted by offset
/// ascending. Returns the dump-to-dump/dump-to-host relocations that
/// must be added to the relocation table as a side effect of resolving
/// fixups that point at not-yet-relocated targets.
pub fn resolve_fixups(
    mut fixups: Vec<Fixup>,
    buffer: &mut DumpBuffer,
    remember: &RememberTable,
    oracle: &dyn FixupOracle,
) -> Result<Vec<DumpReloc>, PdumpError> {
    fixups.sort_by_key(|f| f.at);
    let mut relocs = Vec::new();

    for fixup in &fixups {
        match fixup.target {
            FixupTarget::LispObject { object, tag } => {
                if let Some(host_offset) = oracle.host_resident_offset(object) {
                    relocs.push(DumpReloc {
                        kind: DumpRelocKind::DumpToHostLv(tag),
                        offset: fixup.at,
                    });
                    buffer.patch_at(fixup.at, &(host_offset as i64).to_le_bytes())?;
                } else {
                    let offset = recall_or_error(remember, object)?;
                    relocs.push(DumpReloc {
                        kind: DumpRelocKind::DumpToDumpLv(tag),
                        offset: fixup.at,
                    });
                    buffer.patch_at(fixup.at, &(offset as i64).to_le_bytes())?;
                }
            }
            FixupTarget::LispObjectRaw { object } => {
                if let Some(host_offset) = oracle.host_resident_offset(object) {
                    relocs.push(DumpReloc {
                        kind: DumpRelocKind::DumpToHostPtr,
                        offset: fixup.at,
                    });
                    buffer.patch_at(fixup.at, &(host_offset as i64).to_le_bytes())?;
                } else {
                    let offset = recall_or_error(remember, object)?;
                    relocs.push(DumpReloc {
                        kind: DumpRelocKind::DumpToDumpPtr,
                        offset: fixup.at,
                    });
                    buffer.patch_at(fixup.at, &(offset as i64).to_le_bytes())?;
                }
            }
            FixupTarget::PtrDumpRaw { at } => {
                relocs.push(DumpReloc {
                    kind: DumpRelocKind::DumpToDumpPtr,
                    offset: fixup.at,
                });
                buffer.patch_at(fixup.at, &(at as i64).to_le_bytes())?;
            }
            FixupTarget::ColdBytes { owner } => {
                let at = oracle.cold_bytes_offset(owner).ok_or_else(|| PdumpError::IntegrityViolation {
                    what: "cold blob not emitted".into(),
                })?;
                relocs.push(DumpReloc {
                    kind: DumpRelocKind::DumpToDumpPtr,
                    offset: fixup.at,
                });
                buffer.patch_at(fixup.at, &(at as i64).to_le_bytes())?;
            }
            FixupTarget::BignumData { owner } => {
                let (data_location, nlimbs) = oracle.bignum_reload_info(owner).ok_or_else(|| {
                    PdumpError::IntegrityViolation {
                        what: "bignum not dumped".into(),
                    }
                })?;
                let mut bytes = [0u8; 8];
                bytes[0..4].copy_from_slice(&data_location.to_le_bytes());
                bytes[4..8].copy_from_slice(&nlimbs.to_le_bytes());
                buffer.patch_at(fixup.at, &bytes)?;
                relocs.push(DumpReloc {
                    kind: DumpRelocKind::Bignum,
                    offset: fixup.at,
                });
            }
        }
    }

    Ok(relocs)
}

fn recall_or_error(remember: &RememberTable, object: ObjectId) -> Result<DumpOff, PdumpError> {
    match remember.recall(object) {
        RememberedOffset::At(off) if off > 0 => Ok(off),
        _ => Err(PdumpError::IntegrityViolation {
            what: "fixup object not dumped".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHostObjects;
    impl FixupOracle for NoHostObjects {
        fn host_resident_offset(&self, _object: ObjectId) -> Option<HostOff> {
            None
        }
        fn cold_bytes_offset(&self, _object: ObjectId) -> Option<DumpOff> {
            None
        }
        fn bignum_reload_info(&self, _object: ObjectId) -> Option<(DumpOff, u32)> {
            None
        }
    }

    #[test]
    fn ptr_dump_raw_patches_in_place_and_emits_a_reloc() {
        let mut buffer = DumpBuffer::new();
        let off = buffer.object_start(8).unwrap();
        buffer.object_finish(&[0u8; 8]).unwrap();

        let fixups = vec![Fixup {
            at: off,
            target: FixupTarget::PtrDumpRaw { at: 256 },
        }];
        let remember = RememberTable::new(false);
        let relocs = resolve_fixups(fixups, &mut buffer, &remember, &NoHostObjects).unwrap();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, DumpRelocKind::DumpToDumpPtr);
        assert_eq!(i64::from_le_bytes(buffer.read_at(off, 8).try_into().unwrap()), 256);
    }

    #[test]
    fn lisp_object_raw_to_undumped_target_errors() {
        let mut buffer = DumpBuffer::new();
        let off = buffer.object_start(8).unwrap();
        buffer.object_finish(&[0u8; 8]).unwrap();

        let fixups = vec![Fixup {
            at: off,
            target: FixupTarget::LispObjectRaw { object: ObjectId(99) },
        }];
        let remember = RememberTable::new(false);
        assert!(resolve_fixups(fixups, &mut buffer, &remember, &NoHostObjects).is_err());
    }

    #[test]
    fn lisp_object_to_dumped_target_patches_offset() {
        let mut buffer = DumpBuffer::new();
        let off = buffer.object_start(8).unwrap();
        buffer.object_finish(&[0u8; 8]).unwrap();

        let mut remember = RememberTable::new(false);
        remember.remember(ObjectId(7), RememberedOffset::At(128));

        let fixups = vec![Fixup {
            at: off,
            target: FixupTarget::LispObject {
                object: ObjectId(7),
                tag: Tag::Cons,
            },
        }];
        let relocs = resolve_fixups(fixups, &mut buffer, &remember, &NoHostObjects).unwrap();
        assert_eq!(relocs[0].kind, DumpRelocKind::DumpToDumpLv(Tag::Cons));
        assert_eq!(i64::from_le_bytes(buffer.read_at(off, 8).try_into().unwrap()), 128);
    }

    #[test]
    fn cold_bytes_patches_offset_once_emitted() {
        let mut buffer = DumpBuffer::new();
        let off = buffer.object_start(8).unwrap();
        buffer.object_finish(&[0u8; 8]).unwrap();

        struct OneColdBlob;
        impl FixupOracle for OneColdBlob {
            fn host_resident_offset(&self, _object: ObjectId) -> Option<HostOff> {
                None
            }
            fn cold_bytes_offset(&self, object: ObjectId) -> Option<DumpOff> {
                (object == ObjectId(3)).then_some(4096)
            }
            fn bignum_reload_info(&self, _object: ObjectId) -> Option<(DumpOff, u32)> {
                None
            }
        }

        let fixups = vec![Fixup {
            at: off,
            target: FixupTarget::ColdBytes { owner: ObjectId(3) },
        }];
        let remember = RememberTable::new(false);
        let relocs = resolve_fixups(fixups, &mut buffer, &remember, &OneColdBlob).unwrap();
        assert_eq!(relocs[0].kind, DumpRelocKind::DumpToDumpPtr);
        assert_eq!(i64::from_le_bytes(buffer.read_at(off, 8).try_into().unwrap()), 4096);
    }
}
