//! Field accessors for the major object variants a per-type writer needs.
//!
//! [`crate::value::TypeOracle`] gives the writer enough to dispatch on a
//! value's shape; `HeapFields` gives it enough to actually walk one. Both
//! traits are implemented by the host, never by `pdump-core` itself — the
//! per-type field layouts stay the host's property, as spec'd. Splitting
//! the two keeps `TypeOracle` small enough to also serve the loader side,
//! which never needs field access.

use crate::value::{HostOff, ObjectId, TaggedValue, TypeOracle};

/// Either end of a finalizer's doubly-linked list may be the sentinel
/// list head embedded in the host image rather than another dumped
/// finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerLink {
    SentinelHead(HostOff),
    Object(ObjectId),
}

/// Where a native subroutine's code pointer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubrOrigin {
    /// A primitive (non-native-compiled) subr: resident in the host image
    /// in its entirety, handled like any other `object_host_ptr` value.
    Primitive,
    /// A subr produced by native compilation: the function pointer can
    /// only be bound once its owning compilation unit has been loaded, at
    /// Late/VeryLate relocation time.
    Native { comp_unit: ObjectId },
}

/// Accessors the per-type writers in [`crate::writer`] use to walk one
/// object's fields. Implemented by the host alongside [`TypeOracle`].
pub trait HeapFields: TypeOracle {
    // -- cons --------------------------------------------------------
    fn cons_car(&self, obj: ObjectId) -> TaggedValue;
    fn cons_cdr(&self, obj: ObjectId) -> TaggedValue;

    // -- string ------------------------------------------------------
    fn string_bytes(&self, obj: ObjectId) -> &[u8];
    /// `Some` when this string's byte data is baked into the host image
    /// (e.g. a literal referenced by build-time generated code) rather
    /// than heap-allocated; the writer then points at the host instead of
    /// deferring the bytes to the cold section.
    fn string_host_data(&self, obj: ObjectId) -> Option<HostOff>;

    // -- float ---------------------------------------------------------
    fn float_value(&self, obj: ObjectId) -> f64;

    // -- symbol --------------------------------------------------------
    fn symbol_name(&self, obj: ObjectId) -> TaggedValue;
    fn symbol_redirect(&self, obj: ObjectId) -> crate::value::SymbolRedirect;
    /// Valid when `symbol_redirect` is `PlainValue`.
    fn symbol_plain_value(&self, obj: ObjectId) -> TaggedValue;
    /// Valid when `symbol_redirect` is `VarAlias`: the symbol this one
    /// forwards its value cell to.
    fn symbol_alias_target(&self, obj: ObjectId) -> ObjectId;
    /// Valid when `symbol_redirect` is `Localized`: opaque auxiliary
    /// buffer-local-value data, remembered in a side map rather than
    /// dumped inline.
    fn symbol_localized_aux(&self, obj: ObjectId) -> Vec<u8>;
    /// Valid when `symbol_redirect` is `Forwarded`: the host offset of
    /// the forwarding descriptor compiled into the binary.
    fn symbol_forwarded_host_offset(&self, obj: ObjectId) -> HostOff;
    fn symbol_function(&self, obj: ObjectId) -> TaggedValue;
    fn symbol_plist(&self, obj: ObjectId) -> TaggedValue;
    fn symbol_next(&self, obj: ObjectId) -> Option<ObjectId>;

    // -- bignum ----------------------------------------------------------
    fn bignum_negative(&self, obj: ObjectId) -> bool;
    /// Little-endian limbs, least-significant first.
    fn bignum_limbs(&self, obj: ObjectId) -> &[u32];

    // -- generic vector-like -------------------------------------------
    /// Tagged-value slots for `Generic`/`Obarray`/`SubCharTable`/
    /// `IntervalTree`/`ItreeNode` pseudovectors.
    fn vector_slots(&self, obj: ObjectId) -> &[TaggedValue];
    /// Trailing raw bytes after the slots (e.g. a bool-vector's bitmap).
    fn vector_tail_bytes(&self, obj: ObjectId) -> &[u8];

    // -- hash table ------------------------------------------------------
    fn hash_table_pairs(&self, obj: ObjectId) -> &[(TaggedValue, TaggedValue)];
    fn hash_table_test_name(&self, obj: ObjectId) -> &str;

    // -- marker ----------------------------------------------------------
    fn marker_buffer(&self, obj: ObjectId) -> Option<ObjectId>;
    fn marker_next(&self, obj: ObjectId) -> Option<ObjectId>;
    fn marker_bytepos(&self, obj: ObjectId) -> i64;
    fn marker_charpos(&self, obj: ObjectId) -> i64;

    // -- overlay -----------------------------------------------------------
    fn overlay_buffer(&self, obj: ObjectId) -> Option<ObjectId>;
    fn overlay_start(&self, obj: ObjectId) -> TaggedValue;
    fn overlay_end(&self, obj: ObjectId) -> TaggedValue;
    fn overlay_plist(&self, obj: ObjectId) -> TaggedValue;

    // -- finalizer -----------------------------------------------------
    fn finalizer_function(&self, obj: ObjectId) -> TaggedValue;
    fn finalizer_prev(&self, obj: ObjectId) -> FinalizerLink;
    fn finalizer_next(&self, obj: ObjectId) -> FinalizerLink;

    // -- buffer ----------------------------------------------------------
    fn buffer_text_bytes(&self, obj: ObjectId) -> &[u8];
    fn buffer_base_buffer(&self, obj: ObjectId) -> Option<ObjectId>;
    fn buffer_markers(&self, obj: ObjectId) -> Option<ObjectId>;
    fn buffer_local_slots(&self, obj: ObjectId) -> &[TaggedValue];
    /// Unimplemented in the original and treated the same way here: a
    /// buffer whose overlay tree is non-empty is an `UnsupportedObject`.
    fn buffer_has_overlays(&self, obj: ObjectId) -> bool;

    // -- subr --------------------------------------------------------------
    fn subr_origin(&self, obj: ObjectId) -> SubrOrigin;
    fn subr_symbol_name(&self, obj: ObjectId) -> &[u8];

    // -- native compilation unit -----------------------------------------
    fn comp_unit_file_name(&self, obj: ObjectId) -> &[u8];

    // -- compiled tree-sitter query --------------------------------------
    fn query_language(&self, obj: ObjectId) -> TaggedValue;
    fn query_source(&self, obj: ObjectId) -> TaggedValue;

    // -- remembered data ---------------------------------------------------
    /// Current bytes at a host location registered via
    /// `RememberedData::remember_scalar`, to be embedded as an `Immediate`
    /// emacs-reloc so they come back verbatim after load.
    fn remembered_scalar_bytes(&self, host_offset: HostOff, nbytes: usize) -> Vec<u8>;
    /// Current target of a host location registered via
    /// `RememberedData::remember_tagged_ptr`, dumped like any other
    /// reachable value and re-pointed at via a `DumpLv`/`HostLv` emacs-reloc.
    fn remembered_tagged_ptr_value(&self, host_offset: HostOff) -> TaggedValue;
}
