//! The writer: walks a reachable heap and serializes it into a dump image.
//!
//! [`dump`] is the entry point. It drives a [`Writer`] through four ordered
//! stages — drain the locality queue (hot section), drain deferred hash
//! tables (still hot, just placed last for locality), drain the
//! copied-object queue (discardable section), drain cold objects and blobs
//! (cold section) — then resolves every fixup and assembles the header and
//! relocation tables.

use std::collections::HashMap;

use crate::access::{FinalizerLink, HeapFields, SubrOrigin};
use crate::buffer::DumpBuffer;
use crate::cold::{emit_cold_section, ColdLocations, ColdOp};
use crate::error::PdumpError;
use crate::fixup::{resolve_fixups, Fixup, FixupOracle, FixupTarget};
use crate::header::{DumpHeader, Fingerprint, TableLocator, WORST_CASE_PAGE_SIZE};
use crate::hooks::{RememberedData, RememberedKind};
use crate::queue::DumpQueue;
use crate::reloc::{
    merge_copy_from_dump, DumpReloc, DumpRelocKind, EmacsReloc, EmacsRelocKind, EmacsRelocPayload, RelocPhase,
};
use crate::remember::{RememberTable, RememberedOffset};
use crate::value::{
    DumpOff, HostOff, ObjectId, PVecKind, Reflect, RootKind, SymbolRedirect, Tag, TaggedValue, TypeOracle, Weight,
};

/// Knobs the writer reads once at construction.
///
/// `pack_objects` relaxes alignment to 1 byte; paired with
/// [`DumpBuffer::set_contents_disabled`] it drives the size-only dry run
/// [`measure`] uses instead of writing a real image.
#[derive(Debug, Clone, Copy)]
pub struct DumpConfig {
    pub track_referrers: bool,
    pub pack_objects: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            track_referrers: false,
            pack_objects: false,
        }
    }
}

/// Counts that fall out of the writer's own bookkeeping, useful for a CLI
/// summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpStats {
    pub nr_object_starts: usize,
    pub nr_dump_relocs: usize,
    pub nr_emacs_relocs: usize,
    pub nr_hash_tables: usize,
}

pub struct DumpOutput {
    pub bytes: Vec<u8>,
    pub stats: DumpStats,
}

/// Top-level entry point: dump every object reachable from `reflect`'s
/// roots, plus whatever `remembered` asks to be preserved, into a single
/// in-memory image. Writing the image to disk is the caller's job — the
/// writer never touches a `File` itself.
pub fn dump<H: HeapFields>(
    heap: &H,
    reflect: &dyn Reflect,
    remembered: &RememberedData,
    config: DumpConfig,
    fingerprint: Fingerprint,
) -> Result<DumpOutput, PdumpError> {
    let mut writer = Writer::new(heap, config);
    writer.run(reflect)?;
    writer.finish(fingerprint, remembered)
}

/// A size-only dry pass: runs the same traversal as [`dump`] but with
/// buffer content writes disabled, returning the byte length the real dump
/// would need for its object bodies (table overhead assembled only in
/// [`Writer::finish`] is not included).
pub fn measure<H: HeapFields>(heap: &H, reflect: &dyn Reflect, config: DumpConfig) -> Result<usize, PdumpError> {
    let mut writer = Writer::new(heap, config);
    writer.measure(reflect)
}

/// Reason an object was diverted off the main locality queue instead of
/// being written the moment it's dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferral {
    /// Lives in the host's data segment and must additionally be written
    /// to the dump so its content can be copied back at load.
    Copied,
    /// Written after every other hot object purely for layout locality.
    HashTable,
    /// Floats and bool-vectors: whole objects relocated bodily into the
    /// cold section rather than just referencing a cold blob.
    Cold,
}

/// The writer's working state for one dump operation.
struct Writer<'h, H: HeapFields> {
    heap: &'h H,
    buffer: DumpBuffer,
    queue: DumpQueue,
    remember: RememberTable,
    fixups: Vec<Fixup>,
    dump_relocs: [Vec<DumpReloc>; 3],
    cold_ops: Vec<ColdOp>,
    cold_locations: Option<ColdLocations>,
    object_starts: Vec<DumpOff>,
    dumped_hash_tables: Vec<DumpOff>,
    pending_copied: Vec<ObjectId>,
    pending_hash_tables: Vec<ObjectId>,
    pending_cold: Vec<ObjectId>,
    /// Host offsets of objects on the copied queue, captured at the
    /// moment of first encounter (before the object has a dump offset).
    copied_host_offsets: HashMap<ObjectId, HostOff>,
    discardable_start: DumpOff,
    /// The page-aligned offset the cold section actually starts at —
    /// captured right after `align_raw(WORST_CASE_PAGE_SIZE)`, before any
    /// cold object or cold op is written. `header.cold_start` must be this,
    /// not wherever the buffer's cursor happens to sit once the cold
    /// section is done being written.
    cold_section_start: DumpOff,
}

impl<'h, H: HeapFields> Writer<'h, H> {
    fn new(heap: &'h H, config: DumpConfig) -> Self {
        let mut buffer = DumpBuffer::new();
        buffer.set_packed(config.pack_objects);
        Writer {
            heap,
            buffer,
            queue: DumpQueue::new(),
            remember: RememberTable::new(config.track_referrers),
            fixups: Vec::new(),
            dump_relocs: [Vec::new(), Vec::new(), Vec::new()],
            cold_ops: Vec::new(),
            cold_locations: None,
            object_starts: Vec::new(),
            dumped_hash_tables: Vec::new(),
            pending_copied: Vec::new(),
            pending_hash_tables: Vec::new(),
            pending_cold: Vec::new(),
            copied_host_offsets: HashMap::new(),
            discardable_start: 0,
            cold_section_start: 0,
        }
    }

    fn measure(&mut self, reflect: &dyn Reflect) -> Result<usize, PdumpError> {
        self.buffer.set_contents_disabled(true);
        self.run(reflect)?;
        Ok(self.buffer.len())
    }

    fn run(&mut self, reflect: &dyn Reflect) -> Result<(), PdumpError> {
        self.buffer.append_raw(&vec![0u8; DumpHeader::ENCODED_LEN])?;

        reflect.visit_roots(&mut |value, _root_kind: RootKind| {
            self.classify_and_enqueue(value, 0, Weight::STRONG, "<root>");
        });
        self.drain_hot_queue()?;
        self.drain_hash_tables()?;
        self.discardable_start = self.buffer.offset();
        self.drain_copied_queue()?;
        self.drain_cold_section()?;
        Ok(())
    }

    fn drain_hot_queue(&mut self) -> Result<(), PdumpError> {
        while let Some(object) = self.queue.dequeue(self.buffer.offset()) {
            self.write_dispatched(object)?;
        }
        Ok(())
    }

    /// Hash tables are written only once every non-hash-table object has a
    /// final offset, purely to keep their bodies contiguous for locality —
    /// the fixup resolver would happily patch references to them in any
    /// write order. Draining may surface further hash tables nested inside
    /// hash tables (a table whose value is itself a table), so the loop
    /// keeps going until the pending list is empty rather than snapshotting
    /// it once.
    fn drain_hash_tables(&mut self) -> Result<(), PdumpError> {
        while !self.pending_hash_tables.is_empty() {
            let batch = std::mem::take(&mut self.pending_hash_tables);
            for object in batch {
                self.write_dispatched(object)?;
            }
        }
        Ok(())
    }

    /// Copied objects (the main thread control block, any other
    /// host-resident struct whose content still needs populating from
    /// dumped data) drain in host-address order so the `CopyFromDump`
    /// relocations they produce come out of [`Self::build_emacs_relocs`]
    /// already sorted, letting [`merge_copy_from_dump`] coalesce
    /// contiguous runs.
    fn drain_copied_queue(&mut self) -> Result<(), PdumpError> {
        let mut batch = std::mem::take(&mut self.pending_copied);
        batch.sort_by_key(|obj| self.copied_host_offsets[obj]);
        for object in batch {
            self.write_dispatched(object)?;
        }
        Ok(())
    }

    fn drain_cold_section(&mut self) -> Result<(), PdumpError> {
        self.buffer.align_raw(WORST_CASE_PAGE_SIZE as usize)?;
        self.cold_section_start = self.buffer.offset();

        let batch = std::mem::take(&mut self.pending_cold);
        for object in batch {
            self.write_dispatched(object)?;
        }

        let cold_ops = std::mem::take(&mut self.cold_ops);
        let (_, locations) = emit_cold_section(&mut self.buffer, cold_ops, 1)?;
        self.cold_locations = Some(locations);
        Ok(())
    }

    // -- classification & enqueueing ------------------------------------

    /// Central entry point every reference to a value passes through:
    /// roots, cons cells, vector slots, symbol fields. Handles
    /// self-representing values inline (nothing to enqueue) and otherwise
    /// routes the object onto the right queue exactly once.
    fn classify_and_enqueue(&mut self, value: TaggedValue, basis: DumpOff, weight: Weight, referrer: &str) {
        if self.heap.is_self_representing(value) {
            return;
        }
        let object = value.as_object_id();
        if self.remember.tracking_referrers() {
            self.remember.set_referrer(referrer);
            self.remember.note_reachable(object);
            self.remember.clear_referrer();
        }

        // A plain host-resident reference (a built-in symbol, a primitive
        // subr referenced directly rather than through its own object) is
        // never written to the dump at all: it already exists in the host
        // image, so the fixup that brought us here resolves straight to a
        // `DumpToHostPtr`/`DumpToHostLv` relocation via
        // `FixupOracle::host_resident_offset`. Only objects that must
        // additionally be copied back onto their host location (the
        // "Copied" deferral below) get written.
        if self.heap.host_offset(value).is_some() && !self.heap.wants_copy_from_dump(value) {
            return;
        }

        match self.remember.recall(object) {
            RememberedOffset::NotSeen => {}
            RememberedOffset::OnNormalQueue => {
                self.queue.enqueue(object, basis, weight);
                return;
            }
            // Already finalized or sitting on a deferred queue: nothing
            // more to do here. The reference itself still produced a
            // `Fixup` back in whichever `field_*` helper called us, and
            // that fixup resolves against the remember table directly.
            _ => return,
        }

        if let Some(deferral) = self.deferral_reason(value) {
            match deferral {
                Deferral::Copied => {
                    self.remember.remember(object, RememberedOffset::OnCopiedQueue);
                    let host_offset = self
                        .heap
                        .host_offset(value)
                        .expect("wants_copy_from_dump implies host_offset is Some");
                    self.copied_host_offsets.insert(object, host_offset);
                    self.pending_copied.push(object);
                }
                Deferral::HashTable => {
                    self.remember.remember(object, RememberedOffset::OnHashTableQueue);
                    self.pending_hash_tables.push(object);
                }
                Deferral::Cold => {
                    self.remember.remember(object, RememberedOffset::OnColdQueue);
                    self.pending_cold.push(object);
                }
            }
            return;
        }

        self.remember.remember(object, RememberedOffset::OnNormalQueue);
        self.queue.enqueue(object, basis, weight);
    }

    fn deferral_reason(&self, value: TaggedValue) -> Option<Deferral> {
        if self.heap.wants_copy_from_dump(value) {
            return Some(Deferral::Copied);
        }
        match value.tag() {
            Tag::Float => Some(Deferral::Cold),
            Tag::Vectorlike => match self.heap.pseudovector_kind(value) {
                PVecKind::HashTable => Some(Deferral::HashTable),
                PVecKind::BoolVector => Some(Deferral::Cold),
                _ => None,
            },
            _ => None,
        }
    }

    // -- field helpers ----------------------------------------------------

    /// A tagged-value slot. Self-representing values are inlined; anything
    /// else gets a placeholder word, a `LispObject` fixup, and enqueues the
    /// referent.
    fn field_tagged(&mut self, out: &mut Vec<u8>, field_start: DumpOff, value: TaggedValue, weight: Weight, referrer: &str) {
        if self.heap.is_self_representing(value) {
            out.extend_from_slice(&value.encode_inline().to_le_bytes());
            return;
        }
        out.extend_from_slice(&0xDEAD_F00Du64.to_le_bytes());
        self.fixups.push(Fixup {
            at: field_start,
            target: FixupTarget::LispObject {
                object: value.as_object_id(),
                tag: value.tag(),
            },
        });
        self.classify_and_enqueue(value, field_start, weight, referrer);
    }

    /// A raw pointer field that should be rematerialized as a tagged value
    /// of `kind` at load. `None` (a null pointer) passes straight through.
    fn field_ptr_as_tagged(
        &mut self,
        out: &mut Vec<u8>,
        field_start: DumpOff,
        target: Option<ObjectId>,
        kind: Tag,
        weight: Weight,
        referrer: &str,
    ) {
        let Some(object) = target else {
            out.extend_from_slice(&0i64.to_le_bytes());
            return;
        };
        out.extend_from_slice(&0xDEAD_F00Du64.to_le_bytes());
        self.fixups.push(Fixup {
            at: field_start,
            target: FixupTarget::LispObjectRaw { object },
        });
        let value = self.heap.value_of(object);
        debug_assert_eq!(value.tag(), kind);
        self.classify_and_enqueue(value, field_start, weight, referrer);
    }

    /// A raw pointer into the host's data segment, known immediately.
    fn field_host_ptr(&mut self, out: &mut Vec<u8>, field_start: DumpOff, host_offset: HostOff, phase: RelocPhase) {
        out.extend_from_slice(&(host_offset as i64).to_le_bytes());
        self.dump_relocs[phase.index()].push(DumpReloc {
            kind: DumpRelocKind::DumpToHostPtr,
            offset: field_start,
        });
    }

    /// A raw pointer to a dump location already known (another object's
    /// start, or a blob already appended outside any object bracket).
    fn field_dump_ptr(&mut self, out: &mut Vec<u8>, field_start: DumpOff, target_off: DumpOff, phase: RelocPhase) {
        out.extend_from_slice(&(target_off as i64).to_le_bytes());
        self.dump_relocs[phase.index()].push(DumpReloc {
            kind: DumpRelocKind::DumpToDumpPtr,
            offset: field_start,
        });
    }

    /// Defer a pointer to a blob that will only get a final offset once
    /// the cold section is emitted (string/buffer bytes) or once a
    /// bignum's limbs are written (reload descriptor).
    fn field_fixup_later(&mut self, out: &mut Vec<u8>, field_start: DumpOff, target: FixupTarget) {
        out.extend_from_slice(&0xDEAD_F00Du64.to_le_bytes());
        self.fixups.push(Fixup { at: field_start, target });
    }

    // -- dispatch -----------------------------------------------------------

    fn write_dispatched(&mut self, object: ObjectId) -> Result<(), PdumpError> {
        let value = self.heap.value_of(object);
        let start = self.write_object(value)?;
        self.remember.remember(object, RememberedOffset::At(start));
        Ok(())
    }

    fn write_object(&mut self, value: TaggedValue) -> Result<DumpOff, PdumpError> {
        match value.tag() {
            Tag::Cons => self.write_cons(value.as_object_id()),
            Tag::String => self.write_string(value.as_object_id()),
            Tag::Float => self.write_float(value.as_object_id()),
            Tag::Symbol => self.write_symbol(value.as_object_id()),
            Tag::Vectorlike => self.write_vectorlike(value),
            Tag::Int => Err(PdumpError::IntegrityViolation {
                what: "attempted to dump a self-representing int".into(),
            }),
        }
    }

    fn write_vectorlike(&mut self, value: TaggedValue) -> Result<DumpOff, PdumpError> {
        let obj = value.as_object_id();
        match self.heap.pseudovector_kind(value) {
            PVecKind::Generic | PVecKind::Obarray | PVecKind::SubCharTable | PVecKind::IntervalTree | PVecKind::ItreeNode => {
                self.write_generic_vectorlike(obj)
            }
            PVecKind::HashTable => self.write_hash_table(obj),
            PVecKind::Buffer => self.write_buffer(obj),
            PVecKind::Subr => self.write_subr(obj),
            PVecKind::BoolVector => self.write_bool_vector(obj),
            PVecKind::Marker => self.write_marker(obj),
            PVecKind::Overlay => self.write_overlay(obj),
            PVecKind::Finalizer => self.write_finalizer(obj),
            PVecKind::Bignum => self.write_bignum(obj),
            PVecKind::NativeCompUnit => self.write_native_comp_unit(obj),
            PVecKind::CompiledQuery => self.write_compiled_query(obj),
        }
    }

    // -- per-type writers --------------------------------------------------

    fn write_cons(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(16)?;
        let car = self.heap.cons_car(obj);
        let cdr = self.heap.cons_cdr(obj);
        let mut out = Vec::with_capacity(16);
        self.field_tagged(&mut out, start, car, Weight::NORMAL, "cons.car");
        self.field_tagged(&mut out, start + 8, cdr, Weight::NORMAL, "cons.cdr");
        self.finish_object(start, out)
    }

    fn write_string(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(16)?;
        let bytes = self.heap.string_bytes(obj);
        let len = bytes.len() as u64;
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&len.to_le_bytes());
        if let Some(host_offset) = self.heap.string_host_data(obj) {
            self.field_host_ptr(&mut out, start + 8, host_offset, RelocPhase::Early);
        } else {
            let mut nul_terminated = bytes.to_vec();
            nul_terminated.push(0);
            self.cold_ops.push(ColdOp::Bytes {
                owner: obj,
                bytes: nul_terminated,
            });
            self.field_fixup_later(&mut out, start + 8, FixupTarget::ColdBytes { owner: obj });
        }
        self.finish_object(start, out)
    }

    fn write_float(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(8)?;
        let value = self.heap.float_value(obj);
        self.finish_object(start, value.to_le_bytes().to_vec())
    }

    fn write_symbol(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        // Field layout: name(8) | redirect-tag(8) | value-or-alias-or-aux(8)
        // | function(8) | plist(8) | next(8) = 48 bytes.
        let name = self.heap.symbol_name(obj);
        let redirect = self.heap.symbol_redirect(obj);
        let function = self.heap.symbol_function(obj);
        let plist = self.heap.symbol_plist(obj);
        let next = self.heap.symbol_next(obj);

        // The localized-value aux block's offset must be embeddable
        // directly in the symbol's own bytes, so it has to be appended
        // before `object_start` — `append_raw` refuses to run while an
        // object is in progress.
        let localized_aux_offset = if redirect == SymbolRedirect::Localized {
            let aux = self.heap.symbol_localized_aux(obj);
            Some(self.buffer.append_raw(&aux)?)
        } else {
            None
        };

        let start = self.buffer.object_start(48)?;
        let mut out = Vec::with_capacity(48);
        self.field_tagged(&mut out, start, name, Weight::STRONG, "symbol.name");
        out.extend_from_slice(&(redirect as u64).to_le_bytes());

        let value_field_start = start + 16;
        match redirect {
            SymbolRedirect::PlainValue => {
                let value = self.heap.symbol_plain_value(obj);
                self.field_tagged(&mut out, value_field_start, value, Weight::NORMAL, "symbol.value");
            }
            SymbolRedirect::VarAlias => {
                let target = self.heap.symbol_alias_target(obj);
                self.field_ptr_as_tagged(&mut out, value_field_start, Some(target), Tag::Symbol, Weight::NORMAL, "symbol.alias");
            }
            SymbolRedirect::Localized => {
                let aux_offset = localized_aux_offset.expect("computed above for Localized redirect");
                self.field_dump_ptr(&mut out, value_field_start, aux_offset, RelocPhase::Early);
            }
            SymbolRedirect::Forwarded => {
                let host_offset = self.heap.symbol_forwarded_host_offset(obj);
                self.field_host_ptr(&mut out, value_field_start, host_offset, RelocPhase::Early);
            }
        }

        self.field_tagged(&mut out, start + 24, function, Weight::NORMAL, "symbol.function");
        self.field_tagged(&mut out, start + 32, plist, Weight::NONE, "symbol.plist");
        self.field_ptr_as_tagged(&mut out, start + 40, next, Tag::Symbol, Weight::NONE, "symbol.next");

        self.finish_object(start, out)
    }

    fn write_bignum(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(16)?;
        let negative = self.heap.bignum_negative(obj);
        let limbs = self.heap.bignum_limbs(obj).to_vec();

        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&[negative as u8, 0, 0, 0, 0, 0, 0, 0]);
        self.field_fixup_later(&mut out, start + 8, FixupTarget::BignumData { owner: obj });
        self.cold_ops.push(ColdOp::Limbs { owner: obj, limbs });

        self.finish_object(start, out)
    }

    fn write_marker(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(32)?;
        let buffer = self.heap.marker_buffer(obj);
        let next = self.heap.marker_next(obj);
        let bytepos = self.heap.marker_bytepos(obj);
        let charpos = self.heap.marker_charpos(obj);

        let mut out = Vec::with_capacity(32);
        self.field_ptr_as_tagged(&mut out, start, buffer, Tag::Vectorlike, Weight::NORMAL, "marker.buffer");
        self.field_ptr_as_tagged(&mut out, start + 8, next, Tag::Vectorlike, Weight::NORMAL, "marker.next");
        out.extend_from_slice(&bytepos.to_le_bytes());
        out.extend_from_slice(&charpos.to_le_bytes());

        self.finish_object(start, out)
    }

    fn write_overlay(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(32)?;
        let buffer = self.heap.overlay_buffer(obj);
        let overlay_start = self.heap.overlay_start(obj);
        let overlay_end = self.heap.overlay_end(obj);
        let plist = self.heap.overlay_plist(obj);

        let mut out = Vec::with_capacity(32);
        self.field_ptr_as_tagged(&mut out, start, buffer, Tag::Vectorlike, Weight::NORMAL, "overlay.buffer");
        self.field_tagged(&mut out, start + 8, overlay_start, Weight::NORMAL, "overlay.start");
        self.field_tagged(&mut out, start + 16, overlay_end, Weight::NORMAL, "overlay.end");
        self.field_tagged(&mut out, start + 24, plist, Weight::NONE, "overlay.plist");

        self.finish_object(start, out)
    }

    fn write_finalizer(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(24)?;
        let function = self.heap.finalizer_function(obj);
        let prev = self.heap.finalizer_prev(obj);
        let next = self.heap.finalizer_next(obj);

        let mut out = Vec::with_capacity(24);
        self.field_tagged(&mut out, start, function, Weight::NORMAL, "finalizer.function");
        self.write_finalizer_link(&mut out, start + 8, prev);
        self.write_finalizer_link(&mut out, start + 16, next);

        self.finish_object(start, out)
    }

    /// A finalizer's prev/next link may be the sentinel list head embedded
    /// in the host image rather than another finalizer.
    fn write_finalizer_link(&mut self, out: &mut Vec<u8>, field_start: DumpOff, link: FinalizerLink) {
        match link {
            FinalizerLink::SentinelHead(host_offset) => {
                self.field_host_ptr(out, field_start, host_offset, RelocPhase::Early);
            }
            FinalizerLink::Object(object) => {
                self.field_ptr_as_tagged(out, field_start, Some(object), Tag::Vectorlike, Weight::NORMAL, "finalizer.link");
            }
        }
    }

    fn write_buffer(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        if self.heap.buffer_has_overlays(obj) {
            return Err(self.unsupported(obj, "buffer with non-empty overlay tree"));
        }

        let text = self.heap.buffer_text_bytes(obj).to_vec();
        let base_buffer = self.heap.buffer_base_buffer(obj);
        let markers = self.heap.buffer_markers(obj);
        let local_slots = self.heap.buffer_local_slots(obj).to_vec();

        let start = self.buffer.object_start(24 + 8 * local_slots.len())?;
        let mut out = Vec::with_capacity(24 + 8 * local_slots.len());

        self.cold_ops.push(ColdOp::Bytes { owner: obj, bytes: text });
        self.field_fixup_later(&mut out, start, FixupTarget::ColdBytes { owner: obj });
        self.field_ptr_as_tagged(&mut out, start + 8, base_buffer, Tag::Vectorlike, Weight::NORMAL, "buffer.base");
        self.field_ptr_as_tagged(&mut out, start + 16, markers, Tag::Vectorlike, Weight::NORMAL, "buffer.markers");
        for (i, slot) in local_slots.into_iter().enumerate() {
            self.field_tagged(&mut out, start + 24 + 8 * i as i32, slot, Weight::NONE, "buffer.local");
        }

        self.finish_object(start, out)
    }

    fn write_subr(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        match self.heap.subr_origin(obj) {
            SubrOrigin::Primitive => {
                let host_offset = self
                    .heap
                    .host_offset(self.heap.value_of(obj))
                    .ok_or_else(|| self.unsupported(obj, "primitive subr with no host offset"))?;
                let start = self.buffer.object_start(8)?;
                let mut out = Vec::with_capacity(8);
                self.field_host_ptr(&mut out, start, host_offset, RelocPhase::Early);
                self.finish_object(start, out)
            }
            SubrOrigin::Native { comp_unit } => {
                // Only ever consumed by `NativeLoader` as a dump offset,
                // never dereferenced as a pointer by the host, so no
                // relocation is needed for the name; it still has to be
                // appended before `object_start` since its offset is
                // embedded in the subr's own bytes.
                let name = self.heap.subr_symbol_name(obj).to_vec();
                let name_offset = self.buffer.append_raw(&name)?;

                let start = self.buffer.object_start(16)?;
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&(name_offset as i64).to_le_bytes());
                self.field_ptr_as_tagged(&mut out, start + 8, Some(comp_unit), Tag::Vectorlike, Weight::NORMAL, "subr.comp_unit");
                self.dump_relocs[RelocPhase::VeryLate.index()].push(DumpReloc {
                    kind: DumpRelocKind::NativeSubr,
                    offset: start,
                });
                self.finish_object(start, out)
            }
        }
    }

    fn write_native_comp_unit(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let file_name = self.heap.comp_unit_file_name(obj).to_vec();
        let name_offset = self.buffer.append_raw(&file_name)?;

        let start = self.buffer.object_start(8)?;
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&(name_offset as i64).to_le_bytes());
        self.dump_relocs[RelocPhase::Late.index()].push(DumpReloc {
            kind: DumpRelocKind::NativeCompUnit,
            offset: start,
        });
        self.finish_object(start, out)
    }

    fn write_compiled_query(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let start = self.buffer.object_start(16)?;
        let language = self.heap.query_language(obj);
        let source = self.heap.query_source(obj);
        let mut out = Vec::with_capacity(16);
        self.field_tagged(&mut out, start, language, Weight::NORMAL, "query.language");
        self.field_tagged(&mut out, start + 8, source, Weight::NORMAL, "query.source");
        self.finish_object(start, out)
    }

    fn write_bool_vector(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let tail = self.heap.vector_tail_bytes(obj).to_vec();
        let start = self.buffer.object_start(8 + tail.len())?;
        let mut out = Vec::with_capacity(8 + tail.len());
        out.extend_from_slice(&(tail.len() as u64).to_le_bytes());
        out.extend_from_slice(&tail);
        self.finish_object(start, out)
    }

    fn write_generic_vectorlike(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let slots = self.heap.vector_slots(obj).to_vec();
        let tail = self.heap.vector_tail_bytes(obj).to_vec();
        let start = self.buffer.object_start(8 + 8 * slots.len() + tail.len())?;
        let mut out = Vec::with_capacity(8 + 8 * slots.len() + tail.len());
        out.extend_from_slice(&(slots.len() as u64).to_le_bytes());
        for (i, slot) in slots.into_iter().enumerate() {
            self.field_tagged(&mut out, start + 8 + 8 * i as i32, slot, Weight::NORMAL, "vector.slot");
        }
        out.extend_from_slice(&tail);
        self.finish_object(start, out)
    }

    fn write_hash_table(&mut self, obj: ObjectId) -> Result<DumpOff, PdumpError> {
        let pairs = self.heap.hash_table_pairs(obj).to_vec();
        let test_name = self.heap.hash_table_test_name(obj).as_bytes().to_vec();
        // Dereferenced by the host as a C string pointer, so (unlike the
        // subr/comp-unit name offsets above) this needs a real
        // dump-to-dump relocation, hence the field slot holding it below.
        let test_name_offset = self.buffer.append_raw(&test_name)?;

        let start = self.buffer.object_start(16 + 16 * pairs.len())?;
        let mut out = Vec::with_capacity(16 + 16 * pairs.len());
        self.field_dump_ptr(&mut out, start, test_name_offset, RelocPhase::Early);
        out.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            let key_start = start + 16 + 16 * i as i32;
            let value_start = key_start + 8;
            self.field_tagged(&mut out, key_start, key, Weight::NORMAL, "hash.key");
            self.field_tagged(&mut out, value_start, value, Weight::NORMAL, "hash.value");
        }

        let result = self.finish_object(start, out)?;
        self.dumped_hash_tables.push(start);
        Ok(result)
    }

    // -- shared bookkeeping -------------------------------------------------

    fn finish_object(&mut self, start: DumpOff, out: Vec<u8>) -> Result<DumpOff, PdumpError> {
        self.buffer.object_finish(&out)?;
        self.object_starts.push(start);
        Ok(start)
    }

    fn unsupported(&self, obj: ObjectId, what: &str) -> PdumpError {
        let referrer_path = self.remember.paths_to_root(obj);
        PdumpError::UnsupportedObject {
            type_name: what.to_string(),
            referrer_path,
        }
    }

    // -- finalization --------------------------------------------------------

    fn finish(mut self, fingerprint: Fingerprint, remembered: &RememberedData) -> Result<DumpOutput, PdumpError> {
        let cold_start = self.cold_section_start;
        let cold_locations = self.cold_locations.take().unwrap_or_default();
        let discardable_start = self.discardable_start;

        {
            let oracle = WriterOracle {
                heap: self.heap,
                copied_host_offsets: &self.copied_host_offsets,
                cold_locations: &cold_locations,
            };
            let resolved_relocs = resolve_fixups(std::mem::take(&mut self.fixups), &mut self.buffer, &self.remember, &oracle)?;
            for reloc in resolved_relocs {
                let phase = Self::phase_for_resolved(reloc);
                self.dump_relocs[phase.index()].push(reloc);
            }
        }

        let emacs_relocs = self.build_emacs_relocs(remembered);

        let mut header = DumpHeader::new(fingerprint);
        header.mark_incomplete();
        header.discardable_start = discardable_start;
        header.cold_start = cold_start;

        let object_starts = self.object_starts.clone();
        let object_starts_offset = self.write_table_of_offsets(&object_starts)?;
        header.object_starts = TableLocator {
            offset: object_starts_offset,
            entry_count: object_starts.len() as i32,
        };

        let mut reloc_locators = [TableLocator::default(); 3];
        for phase in RelocPhase::ALL {
            let mut relocs = std::mem::take(&mut self.dump_relocs[phase.index()]);
            relocs.sort_by_key(|r| r.offset);
            let words: Vec<u32> = relocs.iter().map(|r| r.pack()).collect();
            let offset = self.write_table_of_u32(&words)?;
            reloc_locators[phase.index()] = TableLocator {
                offset,
                entry_count: words.len() as i32,
            };
        }
        header.dump_relocs = reloc_locators;

        let dumped_hash_tables = self.dumped_hash_tables.clone();
        let hash_list_offset = self.write_table_of_offsets(&dumped_hash_tables)?;
        header.hash_list = hash_list_offset;

        let emacs_relocs_offset = self.write_emacs_reloc_table(&emacs_relocs)?;
        header.emacs_relocs = TableLocator {
            offset: emacs_relocs_offset,
            entry_count: emacs_relocs.len() as i32,
        };

        header.mark_complete();
        self.buffer.patch_at(0, &header.encode())?;

        let stats = DumpStats {
            nr_object_starts: object_starts.len(),
            nr_dump_relocs: header.dump_relocs.iter().map(|l| l.entry_count as usize).sum(),
            nr_emacs_relocs: emacs_relocs.len(),
            nr_hash_tables: dumped_hash_tables.len(),
        };

        Ok(DumpOutput {
            bytes: self.buffer.into_bytes(),
            stats,
        })
    }

    fn write_table_of_offsets(&mut self, offsets: &[DumpOff]) -> Result<DumpOff, PdumpError> {
        self.buffer.align_raw(4)?;
        let start = self.buffer.offset();
        for &off in offsets {
            self.buffer.append_raw(&off.to_le_bytes())?;
        }
        Ok(start)
    }

    fn write_table_of_u32(&mut self, words: &[u32]) -> Result<DumpOff, PdumpError> {
        self.buffer.align_raw(4)?;
        let start = self.buffer.offset();
        for &w in words {
            self.buffer.append_raw(&w.to_le_bytes())?;
        }
        Ok(start)
    }

    /// One 32-byte fixed-stride record per entry: `host_offset: i64`,
    /// `length: u32`, `kind: u8`, `immediate_n: u8`, 2 bytes padding,
    /// `payload: u64` (a dump/host offset, or the immediate bytes
    /// themselves reinterpreted as a little-endian word), 8 bytes
    /// reserved.
    fn write_emacs_reloc_table(&mut self, relocs: &[EmacsReloc]) -> Result<DumpOff, PdumpError> {
        self.buffer.align_raw(8)?;
        let start = self.buffer.offset();
        for reloc in relocs {
            let kind = match reloc.kind {
                EmacsRelocKind::CopyFromDump => 0u8,
                EmacsRelocKind::Immediate => 1,
                EmacsRelocKind::DumpPtrRaw => 2,
                EmacsRelocKind::HostPtrRaw => 3,
                EmacsRelocKind::DumpLv => 4,
                EmacsRelocKind::HostLv => 5,
            };
            let (payload, immediate_n) = match reloc.payload {
                EmacsRelocPayload::DumpOffset(o) => (o as i64 as u64, 0u8),
                EmacsRelocPayload::HostOffset(o) => (o as i64 as u64, 0u8),
                EmacsRelocPayload::Immediate(bytes, n) => (u64::from_le_bytes(bytes), n),
            };
            self.buffer.append_raw(&(reloc.host_offset as i64).to_le_bytes())?;
            self.buffer.append_raw(&reloc.length.to_le_bytes())?;
            self.buffer.append_raw(&[kind, immediate_n])?;
            self.buffer.append_raw(&[0u8; 2])?;
            self.buffer.append_raw(&payload.to_le_bytes())?;
            self.buffer.append_raw(&[0u8; 8])?;
        }
        Ok(start)
    }

    fn phase_for_resolved(reloc: DumpReloc) -> RelocPhase {
        match reloc.kind {
            DumpRelocKind::NativeCompUnit => RelocPhase::Late,
            DumpRelocKind::NativeSubr => RelocPhase::VeryLate,
            _ => RelocPhase::Early,
        }
    }

    /// Built from exactly two sources: `CopyFromDump` entries for the
    /// drained copied queue, and entries derived from `remembered`'s
    /// scalar/tagged-ptr registrations. Root enumeration via `Reflect`
    /// seeds the traversal but never itself produces an `EmacsReloc` —
    /// `Reflect` exposes no host offset for a root slot.
    fn build_emacs_relocs(&self, remembered: &RememberedData) -> Vec<EmacsReloc> {
        let mut relocs = Vec::new();

        for object in &self.pending_copied {
            let host_offset = self.copied_host_offsets[object];
            let dump_offset = self
                .remember
                .recall(*object)
                .as_final()
                .expect("copied object must have been written before finish");
            let length = self.heap.size_of(self.heap.value_of(*object)) as u32;
            relocs.push(EmacsReloc {
                kind: EmacsRelocKind::CopyFromDump,
                length,
                host_offset,
                payload: EmacsRelocPayload::DumpOffset(dump_offset),
            });
        }

        for location in remembered.iter() {
            match location.kind {
                RememberedKind::Scalar { nbytes } => {
                    let bytes = self.heap.remembered_scalar_bytes(location.host_offset, nbytes);
                    let mut inline = [0u8; 8];
                    let n = bytes.len().min(8);
                    inline[..n].copy_from_slice(&bytes[..n]);
                    relocs.push(EmacsReloc {
                        kind: EmacsRelocKind::Immediate,
                        length: bytes.len() as u32,
                        host_offset: location.host_offset,
                        payload: EmacsRelocPayload::Immediate(inline, n as u8),
                    });
                }
                RememberedKind::TaggedPtr { tag } => {
                    let value = self.heap.remembered_tagged_ptr_value(location.host_offset);
                    if let Some(host_offset) = self.heap.host_offset(value) {
                        relocs.push(EmacsReloc {
                            kind: EmacsRelocKind::HostLv,
                            length: tag as u8 as u32,
                            host_offset: location.host_offset,
                            payload: EmacsRelocPayload::HostOffset(host_offset),
                        });
                    } else if let Some(dump_offset) = self.remember.recall(value.as_object_id()).as_final() {
                        relocs.push(EmacsReloc {
                            kind: EmacsRelocKind::DumpLv,
                            length: tag as u8 as u32,
                            host_offset: location.host_offset,
                            payload: EmacsRelocPayload::DumpOffset(dump_offset),
                        });
                    }
                    // A self-representing target (e.g. nil) needs
                    // neither: the host's own static initializer already
                    // holds the right bit pattern regardless of this dump.
                }
            }
        }

        relocs.sort_by_key(|r| r.host_offset);
        merge_copy_from_dump(relocs)
    }
}

/// Adapts a `Writer`'s own bookkeeping to the narrower view
/// [`resolve_fixups`] needs.
struct WriterOracle<'a, H: TypeOracle> {
    heap: &'a H,
    copied_host_offsets: &'a HashMap<ObjectId, HostOff>,
    cold_locations: &'a ColdLocations,
}

impl<'a, H: TypeOracle> FixupOracle for WriterOracle<'a, H> {
    fn host_resident_offset(&self, object: ObjectId) -> Option<HostOff> {
        if let Some(&host_offset) = self.copied_host_offsets.get(&object) {
            return Some(host_offset);
        }
        let value = self.heap.value_of(object);
        if self.heap.is_self_representing(value) {
            return None;
        }
        self.heap.host_offset(value)
    }

    fn cold_bytes_offset(&self, object: ObjectId) -> Option<DumpOff> {
        self.cold_locations.bytes.get(&object).copied()
    }

    fn bignum_reload_info(&self, object: ObjectId) -> Option<(DumpOff, u32)> {
        self.cold_locations.limbs.get(&object).copied()
    }
}
