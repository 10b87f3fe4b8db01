//! The loader: validate a dump's header, map its three sections, and
//! apply relocations in the phase order spec'd in §4.7/§4.8.
//!
//! Everything here is the writer's mirror image. Where the writer turns a
//! reachable object graph into offsets and deferred patches, the loader
//! turns a mapped byte range plus two relocation tables back into a graph
//! the host can dereference directly — by rewriting every recorded slot
//! from a relative offset into an absolute address, once, right after
//! `mmap` returns.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tracing::{debug, info, instrument};

use crate::bitset::MarkBits;
use crate::header::{round_up_to_page, DumpHeader, Fingerprint, HeaderParseError, WORST_CASE_PAGE_SIZE};
use crate::hooks::HookRegistry;
use crate::mmap::{MappedDump, SectionLayout};
use crate::reloc::{DumpReloc, DumpRelocKind, EmacsReloc, EmacsRelocKind, EmacsRelocPayload, RelocPhase};
use crate::value::{DumpOff, HostOff, NativeLoader, Tag};
use crate::error::LoadStatus;

/// Seam the loader patches the host binary's data segment through.
///
/// `pdump-core` never touches a real address itself: every write goes
/// through this trait, and every tagged-value composition is delegated
/// to it, matching the design note that pointer arithmetic on a
/// [`crate::value::TaggedValue`] stays inside the host's own value
/// module.
pub trait HostImage {
    /// Address of the designated global basis; every [`HostOff`] is
    /// relative to it.
    fn host_basis(&self) -> i64;

    /// Patch `bytes` into the host image at `host_basis() + offset`.
    fn write_at(&mut self, offset: HostOff, bytes: &[u8]);

    /// Compose the in-memory word for a tagged pointer at `absolute_addr`
    /// carrying `tag`.
    fn compose_tagged(&self, absolute_addr: i64, tag: Tag) -> u64;
}

/// Consulted only by the `Bignum` dump-relocation (spec §4.9): the
/// reload descriptor a bignum's fixup wrote is `(data_offset, n_limbs)`
/// relative to the dump; the loader turns `data_offset` into an absolute
/// address and hands both back to the host so it can wire up its
/// arbitrary-precision type however it represents one. Unlike the other
/// relocation kinds this never touches dump bytes directly — the
/// reconstruction happens entirely in the host's own reload, mirroring
/// `mpz_roinit_n` in the original, which rebuilds a live `mpz_t` view
/// over the in-place limbs without persisting anything back to disk.
pub trait BignumReloader {
    fn reload_bignum(&mut self, limb_ptr: i64, n_limbs: u32);
}

/// A `BignumReloader` that panics if ever invoked. Useful default for
/// hosts with no bignum type to speak of.
pub struct NoBignumReloader;

impl BignumReloader for NoBignumReloader {
    fn reload_bignum(&mut self, _limb_ptr: i64, _n_limbs: u32) {
        panic!("dump contains a bignum but no BignumReloader was supplied");
    }
}

/// Knobs the loader reads once, at the start of [`load`].
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub path: PathBuf,
    /// Forwarded to the native loader as `argv0`, mirroring
    /// `pdumper_load(filename, argv0)` (spec §6) — used to resolve
    /// natively-compiled `.eln` files relative to the running
    /// executable's install directory.
    pub argv0: Option<PathBuf>,
}

/// Process-wide record of a successfully loaded dump (spec §3, §5).
///
/// Created exactly once per process by [`load`]; read-mostly thereafter
/// except for the mark-bit swap at GC cycle boundaries.
pub struct LoadedDump {
    mapped: MappedDump,
    layout: SectionLayout,
    header: DumpHeader,
    dump_base: i64,
    load_time_seconds: f64,
    filename: PathBuf,
    mark_bits: [MarkBits; 2],
    /// Index into `mark_bits` of the bitset the host is currently
    /// building up during a collection; the other index holds the
    /// bitset from the previous cycle (`new_all_ones` until the first
    /// real collection runs, per spec §4.8 step 6).
    current: usize,
}

impl LoadedDump {
    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn load_time_seconds(&self) -> f64 {
        self.load_time_seconds
    }

    /// The address every `DumpOff` in this dump is now relative to.
    pub fn dump_base(&self) -> i64 {
        self.dump_base
    }

    pub fn dump_bytes(&self) -> &[u8] {
        self.mapped.as_slice()
    }

    pub fn current_mark_bits(&self) -> &MarkBits {
        &self.mark_bits[self.current]
    }

    pub fn last_mark_bits(&self) -> &MarkBits {
        &self.mark_bits[1 - self.current]
    }

    /// Swap current/last mark bitsets at a GC cycle boundary and clear
    /// the new current bitset so the collector can rebuild it from
    /// scratch.
    pub fn swap_mark_bits(&mut self) {
        self.current = 1 - self.current;
        self.mark_bits[self.current].clear_all();
    }

    pub fn stats(&self) -> DumpLoadStats {
        DumpLoadStats {
            load_time_seconds: self.load_time_seconds,
            dump_file_path: self.filename.clone(),
        }
    }
}

/// Caller-visible counterpart of spec §6's `stats()`.
#[derive(Debug, Clone)]
pub struct DumpLoadStats {
    pub load_time_seconds: f64,
    pub dump_file_path: PathBuf,
}

static PROCESS_DUMP: OnceLock<Mutex<LoadedDump>> = OnceLock::new();

/// Install `dump` as the process-wide loaded-dump record. A process loads
/// at most one dump (spec §5: "We can load only one dump"); a second
/// call is a programming error and returns `dump` back to the caller.
fn install(dump: LoadedDump) -> Result<(), LoadedDump> {
    PROCESS_DUMP.set(Mutex::new(dump)).map_err(|m| {
        m.into_inner().unwrap_or_else(|poison| poison.into_inner())
    })
}

/// Access the process-wide loaded dump, if [`load`] has ever succeeded
/// in this process.
pub fn loaded() -> Option<&'static Mutex<LoadedDump>> {
    PROCESS_DUMP.get()
}

/// Top-level entry point: validate, map, and relocate a dump file,
/// running every registered hook at its designated point (spec §4.8).
///
/// `host` receives every dump-to-host and host-targeted relocation;
/// `native_loader` resolves native compilation units and subrs during
/// Late/VeryLate; `bignums` reconstructs arbitrary-precision values.
/// On success the resulting [`LoadedDump`] is also installed as the
/// process-wide singleton (see [`loaded`]).
#[instrument(skip(host, native_loader, bignums, hooks, fingerprint_ok), fields(path = %config.path.display()))]
pub fn load(
    config: &LoadConfig,
    fingerprint_ok: impl Fn(Fingerprint) -> bool,
    host: &mut dyn HostImage,
    native_loader: &dyn NativeLoader,
    bignums: &mut dyn BignumReloader,
    hooks: &HookRegistry,
) -> Result<(), LoadStatus> {
    let start = Instant::now();

    // Step 1: open + fstat.
    let file = File::open(&config.path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoadStatus::FileNotFound(config.path.clone())
        } else {
            LoadStatus::Io(e)
        }
    })?;
    let metadata = file.metadata().map_err(LoadStatus::Io)?;
    let file_size = metadata.len();
    if file_size < DumpHeader::ENCODED_LEN as u64 {
        return Err(LoadStatus::BadFileType(config.path.clone()));
    }
    if file_size > i32::MAX as u64 {
        return Err(LoadStatus::Malformed);
    }

    // Step 2: read + validate header.
    let mut header_buf = vec![0u8; DumpHeader::ENCODED_LEN];
    {
        use std::io::Read;
        (&file).read_exact(&mut header_buf).map_err(LoadStatus::Io)?;
    }
    let (header, complete) = match DumpHeader::parse(&header_buf) {
        Ok(pair) => pair,
        Err(HeaderParseError::TooShort) => return Err(LoadStatus::Malformed),
        Err(HeaderParseError::BadMagic) => return Err(LoadStatus::BadFileType(config.path.clone())),
    };
    if !complete {
        return Err(LoadStatus::FailedDump);
    }
    if !fingerprint_ok(header.fingerprint) {
        return Err(LoadStatus::VersionMismatch);
    }

    // Step 3: compute section extents.
    let adj_discardable_start = round_up_to_page(header.discardable_start, WORST_CASE_PAGE_SIZE);
    debug_assert!(adj_discardable_start <= header.cold_start);
    let layout = SectionLayout {
        hot_end: adj_discardable_start as usize,
        discardable_end: header.cold_start as usize,
        total_len: file_size as usize,
    };

    // Step 4: map the three sections contiguously.
    let mut mapped = MappedDump::map_sections(&file, layout).map_err(LoadStatus::Io)?;

    // Step 5: refuse addresses the host's tagged-pointer scheme can't
    // represent. We have no real ASLR address here (the "address" is
    // the mapped buffer's own location), so the only representable-range
    // check we can make portably is that every dump-relative offset
    // still fits the 32-bit `DumpOff` arithmetic the rest of the format
    // assumes.
    if layout.total_len > i32::MAX as usize {
        return Err(LoadStatus::Oom);
    }
    let dump_base = mapped.as_slice().as_ptr() as i64;

    // Step 6: mark bitsets.
    let mark_bits = [
        MarkBits::new_zeroed(header.discardable_start),
        MarkBits::new_all_ones(header.discardable_start),
    ];

    info!(
        hot_end = layout.hot_end,
        discardable_end = layout.discardable_end,
        total_len = layout.total_len,
        "mapped dump sections"
    );

    // Step 7: Early dump relocations, then every emacs relocation.
    apply_dump_relocs(mapped.as_mut_slice(), dump_base, &header, RelocPhase::Early, host, native_loader, bignums)?;
    apply_emacs_relocs(mapped.as_slice(), dump_base, &header, host)?;

    // Step 8: discard the discardable range now that nothing will read
    // it from the dump again.
    mapped.discard(layout.discardable());

    // Step 9: early hooks.
    hooks.run_early();
    debug!("ran early hooks");

    // Step 10: Late, then VeryLate.
    apply_dump_relocs(mapped.as_mut_slice(), dump_base, &header, RelocPhase::Late, host, native_loader, bignums)?;
    apply_dump_relocs(mapped.as_mut_slice(), dump_base, &header, RelocPhase::VeryLate, host, native_loader, bignums)?;

    // Step 11: late hooks.
    hooks.run_late();
    debug!("ran late hooks");

    let load_time_seconds = start.elapsed().as_secs_f64();
    let dump = LoadedDump {
        mapped,
        layout,
        header,
        dump_base,
        load_time_seconds,
        filename: config.path.clone(),
        mark_bits,
        current: 0,
    };
    install(dump).map_err(|_| LoadStatus::Malformed)?;
    info!(load_time_seconds, "dump load complete");
    Ok(())
}

fn read_i64(bytes: &[u8], at: DumpOff) -> i64 {
    let at = at as usize;
    i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn write_i64(bytes: &mut [u8], at: DumpOff, value: i64) {
    let at = at as usize;
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(bytes: &mut [u8], at: DumpOff, value: u64) {
    let at = at as usize;
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Apply every relocation recorded for `phase`, in table order (the
/// table is sorted ascending by offset at write time; application order
/// within a phase makes no semantic difference since each relocation
/// touches a disjoint slot, but ascending order gives the most
/// cache-friendly sweep of the mapped region).
fn apply_dump_relocs(
    mapped: &mut [u8],
    dump_base: i64,
    header: &DumpHeader,
    phase: RelocPhase,
    host: &mut dyn HostImage,
    native_loader: &dyn NativeLoader,
    bignums: &mut dyn BignumReloader,
) -> Result<(), LoadStatus> {
    let locator = header.dump_relocs[phase.index()];
    let table_start = locator.offset as usize;
    let count = locator.entry_count as usize;
    let mut words = Vec::with_capacity(count);
    for i in 0..count {
        let at = table_start + i * 4;
        words.push(u32::from_le_bytes(mapped[at..at + 4].try_into().unwrap()));
    }

    for word in words {
        let reloc = DumpReloc::unpack(word).ok_or(LoadStatus::Malformed)?;
        apply_one_dump_reloc(mapped, dump_base, reloc, host, native_loader, bignums)?;
    }
    Ok(())
}

/// §4.9: apply a single dump-relocation.
fn apply_one_dump_reloc(
    mapped: &mut [u8],
    dump_base: i64,
    reloc: DumpReloc,
    host: &mut dyn HostImage,
    native_loader: &dyn NativeLoader,
    bignums: &mut dyn BignumReloader,
) -> Result<(), LoadStatus> {
    debug_assert_eq!(reloc.offset % 4, 0, "unaligned dump relocation");
    match reloc.kind {
        DumpRelocKind::DumpToHostPtr => {
            let value = read_i64(mapped, reloc.offset);
            write_i64(mapped, reloc.offset, host.host_basis() + value);
        }
        DumpRelocKind::DumpToDumpPtr => {
            let value = read_i64(mapped, reloc.offset);
            write_i64(mapped, reloc.offset, dump_base + value);
        }
        DumpRelocKind::DumpToDumpLv(tag) => {
            let value = read_i64(mapped, reloc.offset);
            let composed = host.compose_tagged(dump_base + value, tag);
            write_u64(mapped, reloc.offset, composed);
        }
        DumpRelocKind::DumpToHostLv(tag) => {
            let value = read_i64(mapped, reloc.offset);
            let composed = host.compose_tagged(host.host_basis() + value, tag);
            write_u64(mapped, reloc.offset, composed);
        }
        DumpRelocKind::Bignum => {
            let at = reloc.offset as usize;
            let data_location = i32::from_le_bytes(mapped[at..at + 4].try_into().unwrap());
            let n_limbs = u32::from_le_bytes(mapped[at + 4..at + 8].try_into().unwrap());
            let limb_ptr = dump_base + data_location as i64;
            bignums.reload_bignum(limb_ptr, n_limbs);
        }
        DumpRelocKind::NativeCompUnit => {
            let at = reloc.offset as usize;
            let name_offset = i64::from_le_bytes(mapped[at..at + 8].try_into().unwrap()) as DumpOff;
            let handle = native_loader
                .load_comp_unit(name_offset)
                .map_err(|_| LoadStatus::Malformed)?;
            write_i64(mapped, reloc.offset, handle as i64);
        }
        DumpRelocKind::NativeSubr => {
            let at = reloc.offset as usize;
            let name_offset = i64::from_le_bytes(mapped[at..at + 8].try_into().unwrap()) as DumpOff;
            // The comp-unit handle field sits right after the name
            // offset in `write_subr`'s 16-byte layout.
            let comp_unit_word = i64::from_le_bytes(mapped[at + 8..at + 16].try_into().unwrap());
            let handle = native_loader
                .bind_subr_pointer(comp_unit_word as HostOff, name_offset)
                .map_err(|_| LoadStatus::Malformed)?;
            write_i64(mapped, reloc.offset, handle as i64);
        }
    }
    Ok(())
}

/// §4.10: apply every emacs-relocation, reading the fixed-stride table
/// [`crate::writer`] emits (see `write_emacs_reloc_table`'s doc comment
/// for the exact layout).
fn apply_emacs_relocs(
    mapped: &[u8],
    dump_base: i64,
    header: &DumpHeader,
    host: &mut dyn HostImage,
) -> Result<(), LoadStatus> {
    const RECORD_LEN: usize = 32;
    let table_start = header.emacs_relocs.offset as usize;
    let count = header.emacs_relocs.entry_count as usize;

    for i in 0..count {
        let at = table_start + i * RECORD_LEN;
        let record = &mapped[at..at + RECORD_LEN];
        let host_offset = i64::from_le_bytes(record[0..8].try_into().unwrap()) as HostOff;
        let length = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let kind = record[12];
        let immediate_n = record[13];
        let payload_word = u64::from_le_bytes(record[16..24].try_into().unwrap());

        match kind {
            0 => {
                // CopyFromDump
                let dump_offset = payload_word as i64 as DumpOff as usize;
                let bytes = &mapped[dump_offset..dump_offset + length as usize];
                host.write_at(host_offset, bytes);
            }
            1 => {
                // Immediate
                let bytes = payload_word.to_le_bytes();
                host.write_at(host_offset, &bytes[..(immediate_n as usize).min(length as usize)]);
            }
            2 => {
                // DumpPtrRaw
                let dump_offset = payload_word as i64 as DumpOff as i64;
                let absolute = dump_base + dump_offset;
                host.write_at(host_offset, &absolute.to_le_bytes());
            }
            3 => {
                // HostPtrRaw
                let other_host_offset = payload_word as i64;
                let absolute = host.host_basis() + other_host_offset;
                host.write_at(host_offset, &absolute.to_le_bytes());
            }
            4 => {
                // DumpLv
                let tag = Tag::from_index(length as u8).ok_or(LoadStatus::Malformed)?;
                let dump_offset = payload_word as i64 as DumpOff as i64;
                let composed = host.compose_tagged(dump_base + dump_offset, tag);
                host.write_at(host_offset, &composed.to_le_bytes());
            }
            5 => {
                // HostLv
                let tag = Tag::from_index(length as u8).ok_or(LoadStatus::Malformed)?;
                let other_host_offset = payload_word as i64;
                let composed = host.compose_tagged(host.host_basis() + other_host_offset, tag);
                host.write_at(host_offset, &composed.to_le_bytes());
            }
            _ => return Err(LoadStatus::Malformed),
        }
    }
    Ok(())
}

/// Decode the raw emacs-reloc table into [`EmacsReloc`] values. Exposed
/// for tests and diagnostics; [`apply_emacs_relocs`] reads the same bytes
/// directly rather than allocating through this for the hot load path.
pub fn decode_emacs_relocs(mapped: &[u8], header: &DumpHeader) -> Result<Vec<EmacsReloc>, LoadStatus> {
    const RECORD_LEN: usize = 32;
    let table_start = header.emacs_relocs.offset as usize;
    let count = header.emacs_relocs.entry_count as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let at = table_start + i * RECORD_LEN;
        let record = &mapped[at..at + RECORD_LEN];
        let host_offset = i64::from_le_bytes(record[0..8].try_into().unwrap()) as HostOff;
        let length = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let kind = record[12];
        let immediate_n = record[13];
        let payload_word = u64::from_le_bytes(record[16..24].try_into().unwrap());
        let kind = match kind {
            0 => EmacsRelocKind::CopyFromDump,
            1 => EmacsRelocKind::Immediate,
            2 => EmacsRelocKind::DumpPtrRaw,
            3 => EmacsRelocKind::HostPtrRaw,
            4 => EmacsRelocKind::DumpLv,
            5 => EmacsRelocKind::HostLv,
            _ => return Err(LoadStatus::Malformed),
        };
        let payload = match kind {
            EmacsRelocKind::CopyFromDump | EmacsRelocKind::DumpPtrRaw | EmacsRelocKind::DumpLv => {
                EmacsRelocPayload::DumpOffset(payload_word as i64 as DumpOff)
            }
            EmacsRelocKind::HostPtrRaw | EmacsRelocKind::HostLv => {
                EmacsRelocPayload::HostOffset(payload_word as i64 as HostOff)
            }
            EmacsRelocKind::Immediate => {
                let mut inline = [0u8; 8];
                inline.copy_from_slice(&payload_word.to_le_bytes());
                EmacsRelocPayload::Immediate(inline, immediate_n)
            }
        };
        out.push(EmacsReloc { kind, length, host_offset, payload });
    }
    Ok(out)
}
