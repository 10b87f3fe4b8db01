//! The tagged-value representation and the `TypeOracle`/`Reflect` seams
//! through which the writer and loader consult the host interpreter.
//!
//! Everything in this module is deliberately thin: the per-type field
//! layouts, the garbage collector, and the interpreter's object identity
//! scheme are owned by the host, not by `pdump-core`. We only need enough
//! of a shared vocabulary — a type tag, an object id, a handful of
//! predicates — to drive the writer's dispatch and the loader's relocation
//! application.

use std::fmt;

/// Offset into the dump, relative to the start of the file.
pub type DumpOff = i32;

/// Offset relative to the host binary's fixed basis address (see
/// [`HostBasis`]).
pub type HostOff = i32;

/// Discriminant carried in the low bits of a [`TaggedValue`].
///
/// Mirrors the six tagged-value kinds a relocatable heap needs to
/// distinguish (two host integer tag bits collapse to `Int` here, since
/// the writer never needs to tell them apart: both are self-representing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Int = 0,
    Symbol = 1,
    String = 2,
    Cons = 3,
    Float = 4,
    Vectorlike = 5,
}

impl Tag {
    pub const COUNT: usize = 6;

    pub fn from_index(i: u8) -> Option<Self> {
        Some(match i {
            0 => Tag::Int,
            1 => Tag::Symbol,
            2 => Tag::String,
            3 => Tag::Cons,
            4 => Tag::Float,
            5 => Tag::Vectorlike,
            _ => return None,
        })
    }
}

/// A stable identifier for one heap object, opaque to `pdump-core`.
///
/// The host assigns these; `pdump-core` only ever uses them as hash-map
/// keys (dumped-offset lookups, referrer edges, weight bookkeeping) or to
/// ask the [`TypeOracle`] for more information. Never interpreted as an
/// address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x})", self.0)
    }
}

/// The host's machine word: a payload plus a [`Tag`].
///
/// Never do pointer arithmetic on the payload outside this module — the
/// payload is either a self-representing integer, an [`ObjectId`] encoded
/// as `u64`, or (for built-in symbols) a raw [`HostOff`]. The writer and
/// loader distinguish these cases through the [`TypeOracle`], never by
/// peeking at the bits themselves.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedValue {
    payload: u64,
    tag: Tag,
}

impl TaggedValue {
    pub fn new(payload: u64, tag: Tag) -> Self {
        TaggedValue { payload, tag }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn payload(&self) -> u64 {
        self.payload
    }

    pub fn as_object_id(&self) -> ObjectId {
        ObjectId(self.payload)
    }

    pub fn as_int(&self) -> Option<i64> {
        (self.tag == Tag::Int).then_some(self.payload as i64)
    }

    /// Pack this value into the single 8-byte word a self-representing
    /// field is written as: the tag in the top byte, the payload in the
    /// low 56 bits. Only meaningful for values `TypeOracle::
    /// is_self_representing` accepts — everything else goes through a
    /// [`crate::fixup::Fixup`] instead.
    pub fn encode_inline(&self) -> u64 {
        (self.payload & 0x00ff_ffff_ffff_ffff) | ((self.tag as u64) << 56)
    }

    pub fn decode_inline(word: u64) -> Self {
        let tag = Tag::from_index((word >> 56) as u8).unwrap_or(Tag::Int);
        TaggedValue::new(word & 0x00ff_ffff_ffff_ffff, tag)
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedValue({:?}, {:#x})", self.tag, self.payload)
    }
}

/// Which pseudovector variant a `Vectorlike` value is.
///
/// Corresponds to the secondary dispatch performed once the primary tag
/// is already known to be `Vectorlike`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PVecKind {
    Generic,
    HashTable,
    Obarray,
    Buffer,
    Subr,
    BoolVector,
    SubCharTable,
    IntervalTree,
    ItreeNode,
    Marker,
    Overlay,
    Finalizer,
    Bignum,
    NativeCompUnit,
    CompiledQuery,
}

/// How a symbol's value cell is wired up.
///
/// `PlainValue` is the common case (the symbol directly holds a value);
/// the other three require an auxiliary "forwarding" block to be
/// remembered in a side map because their target lives somewhere other
/// than the symbol's own value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRedirect {
    PlainValue,
    VarAlias,
    Localized,
    Forwarded,
}

/// Classification of a static GC root, passed to the [`Reflect`] visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// A root backed by a C-level global symbol table slot.
    CSymbol,
    /// A root registered through `staticpro`-style bookkeeping.
    Staticpro,
    Other,
}

/// Edge weight used by the locality scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Weight(pub i32);

impl Weight {
    pub const NONE: Weight = Weight(0);
    pub const NORMAL: Weight = Weight(1000);
    pub const STRONG: Weight = Weight(1200);
}

/// A versioned, explicit description of the host's per-type field layout.
///
/// Replaces a build-time struct-layout hash with a runtime-computed
/// descriptor: the host computes this descriptor and a test
/// snapshot-compares it against a checked-in golden value. It also
/// feeds the dump [`crate::header::Fingerprint`] so that two binaries
/// built against incompatible field layouts refuse to share a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// One descriptive line per dumped type, e.g. `"Lisp_Cons: 16 bytes,
    /// fields car@0, cdr@8"`. Order matters: it is part of what gets
    /// hashed into the fingerprint.
    pub type_layouts: Vec<String>,
}

impl LayoutDescriptor {
    /// A cheap, stable digest used as part of [`crate::header::Fingerprint`].
    pub fn digest(&self) -> [u8; 8] {
        // FNV-1a, 64-bit. Good enough for a layout-mismatch tripwire; this
        // is not a cryptographic fingerprint, just a build-identity tag.
        let mut hash: u64 = 0xcbf29ce484222325;
        for line in &self.type_layouts {
            for byte in line.as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            hash ^= 0x0a;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash.to_le_bytes()
    }
}

/// Everything the writer and loader need to ask of the host interpreter.
///
/// The type registry and per-type field layouts belong to the host.
/// `pdump-core` only consumes them through this trait plus the per-type
/// accessors a concrete writer needs (added by the caller's own
/// object-walking code, not by this trait).
pub trait TypeOracle {
    fn classify(&self, value: TaggedValue) -> Tag {
        value.tag()
    }

    fn pseudovector_kind(&self, value: TaggedValue) -> PVecKind;

    /// Built-in symbols (`nil`, `t`, keywords baked into the host image)
    /// live in the host's data segment, not the managed heap. Unlike a
    /// fixnum their tagged representation is address-based (a pointer
    /// into the host's own symbol table), so it still needs a
    /// `DumpToHostLv` relocation on load, not inlining — see
    /// [`Self::is_self_representing`].
    fn is_builtin_symbol(&self, value: TaggedValue) -> bool;

    /// Only fixnums carry a bit pattern that's stable across invocations
    /// of the host binary independent of any address, so only they are
    /// written inline instead of being enqueued. Built-in symbols are
    /// *referenced* rather than dumped (classify_and_enqueue resolves them
    /// straight to a host offset without ever enqueueing them) but their
    /// tagged representation is still address-dependent and must go
    /// through the normal fixup/relocation machinery.
    fn is_self_representing(&self, value: TaggedValue) -> bool {
        value.tag() == Tag::Int
    }

    /// Size in bytes of a vector-like object's on-disk (and in-memory)
    /// representation, header included.
    fn size_of(&self, value: TaggedValue) -> usize;

    /// If `value` is an object embedded in the host's data segment
    /// (builtin symbol, primitive subr, the main thread control block),
    /// the offset of that embedding relative to the host basis.
    fn host_offset(&self, value: TaggedValue) -> Option<HostOff>;

    /// Whether a host-resident object (`host_offset` returns `Some`) must
    /// additionally be written to the dump and copied back onto its host
    /// location at load time (the "copied" deferred queue) — e.g. the
    /// main thread control block, whose fields still need populating from
    /// dumped data even though the struct itself lives at a fixed host
    /// address. Builtin symbols and non-native subrs answer `false`:
    /// referring to them is enough, their content never changes.
    fn wants_copy_from_dump(&self, _value: TaggedValue) -> bool {
        false
    }

    /// A short, human-readable type name used in `UnsupportedObject`
    /// diagnostics.
    fn type_name(&self, value: TaggedValue) -> &'static str;

    /// Recover a full [`TaggedValue`] from a bare [`ObjectId`] returned by
    /// an accessor. Accessors hand back ids rather than tagged values
    /// because most of the time the caller already knows the tag from
    /// context; the writer's generic enqueue path doesn't, so it asks the
    /// oracle to re-tag.
    fn value_of(&self, obj: ObjectId) -> TaggedValue;

    /// See [`LayoutDescriptor`].
    fn layout_descriptor(&self) -> LayoutDescriptor;
}

/// Enumerates static GC roots.
///
/// The writer's caller drives dumping by handing the initial queue
/// contents; `Reflect` exists so a generic "dump everything reachable
/// from the roots" entry point can be offered without `pdump-core` itself
/// knowing what a root table looks like.
pub trait Reflect {
    fn visit_roots(&self, visit: &mut dyn FnMut(TaggedValue, RootKind));
}

/// Delegate for native compilation units and native subroutines. These
/// run after the early relocation pass — the host's interpreter must
/// already be usable — so they are modeled as a trait consulted only
/// during the late/very-late relocation passes, never during the
/// writer's own pass.
pub trait NativeLoader {
    /// Dynamically load the compilation unit whose name was recorded in
    /// the cold section at `name_offset`, returning a host-relative
    /// handle offset to patch into the dump.
    fn load_comp_unit(&self, name_offset: DumpOff) -> Result<HostOff, String>;

    /// Resolve a native subr's function pointer from an already-loaded
    /// compilation unit and the subr's recorded symbol name.
    fn bind_subr_pointer(&self, comp_unit: HostOff, symbol_name_offset: DumpOff) -> Result<HostOff, String>;
}

/// A `NativeLoader` that refuses every request. Useful as the default for
/// hosts that never dump native-compiled code, and for tests.
pub struct NoNativeLoader;

impl NativeLoader for NoNativeLoader {
    fn load_comp_unit(&self, _name_offset: DumpOff) -> Result<HostOff, String> {
        Err("no native loader configured".into())
    }

    fn bind_subr_pointer(&self, _comp_unit: HostOff, _symbol_name_offset: DumpOff) -> Result<HostOff, String> {
        Err("no native loader configured".into())
    }
}
