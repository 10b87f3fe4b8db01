//! A toy interpreter heap used to demonstrate `pdump-core` end to end.
//!
//! Real hosts keep their objects in whatever arena their GC already uses
//! and implement [`TypeOracle`]/[`HeapFields`]/[`Reflect`] as thin views
//! over it. This one keeps everything in a flat `Vec<Obj>` with an
//! [`ObjectId`] doubling as the arena index — there is no host-resident
//! data, no native code, and no arbitrary-precision integers, so the
//! corresponding trait methods are simply never reached and say so.

use pdump_core::access::{FinalizerLink, HeapFields, SubrOrigin};
use pdump_core::value::{
    HostOff, LayoutDescriptor, ObjectId, PVecKind, Reflect, RootKind, SymbolRedirect, Tag, TaggedValue, TypeOracle,
};

#[derive(Debug, Clone)]
enum Obj {
    Cons {
        car: TaggedValue,
        cdr: TaggedValue,
    },
    Str(Vec<u8>),
    Float(f64),
    Symbol {
        name: TaggedValue,
        value: TaggedValue,
        function: TaggedValue,
        plist: TaggedValue,
        next: Option<ObjectId>,
    },
    Vector(Vec<TaggedValue>),
    HashTable {
        test: String,
        pairs: Vec<(TaggedValue, TaggedValue)>,
    },
}

/// A minimal Lisp-shaped heap: conses, strings, floats, symbols,
/// generic vectors and hash tables. Bignums, markers, overlays,
/// finalizers, buffers, subrs and native compilation units are out of
/// scope for the demo and their accessors are unreachable.
pub struct Heap {
    objects: Vec<Obj>,
    roots: Vec<TaggedValue>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            roots: Vec::new(),
        }
    }

    fn push(&mut self, obj: Obj) -> ObjectId {
        let id = ObjectId(self.objects.len() as u64);
        self.objects.push(obj);
        id
    }

    pub fn fixnum(value: i64) -> TaggedValue {
        TaggedValue::new(value as u64, Tag::Int)
    }

    pub fn tagged(&self, id: ObjectId) -> TaggedValue {
        self.value_of(id)
    }

    pub fn cons(&mut self, car: TaggedValue, cdr: TaggedValue) -> ObjectId {
        self.push(Obj::Cons { car, cdr })
    }

    /// Patch an already-created cons's `cdr` in place, the only way to
    /// build a cycle through objects whose ids aren't known until after
    /// their neighbors already reference them.
    pub fn set_cdr(&mut self, id: ObjectId, cdr: TaggedValue) {
        match &mut self.objects[id.0 as usize] {
            Obj::Cons { cdr: slot, .. } => *slot = cdr,
            _ => panic!("set_cdr on a non-cons object"),
        }
    }

    pub fn string(&mut self, bytes: impl Into<Vec<u8>>) -> ObjectId {
        self.push(Obj::Str(bytes.into()))
    }

    pub fn float(&mut self, value: f64) -> ObjectId {
        self.push(Obj::Float(value))
    }

    pub fn symbol(&mut self, name: TaggedValue, value: TaggedValue, function: TaggedValue, plist: TaggedValue) -> ObjectId {
        self.push(Obj::Symbol {
            name,
            value,
            function,
            plist,
            next: None,
        })
    }

    pub fn vector(&mut self, slots: Vec<TaggedValue>) -> ObjectId {
        self.push(Obj::Vector(slots))
    }

    pub fn hash_table(&mut self, test: impl Into<String>, pairs: Vec<(TaggedValue, TaggedValue)>) -> ObjectId {
        self.push(Obj::HashTable {
            test: test.into(),
            pairs,
        })
    }

    pub fn add_root(&mut self, value: TaggedValue) {
        self.roots.push(value);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

/// A handful of conses sharing a string, a cyclic list, a hash table and
/// a vector, all reachable from a small root set — enough to exercise
/// the locality queue, the fixup resolver and hash-table deferral.
pub fn demo_heap() -> Heap {
    let mut heap = Heap::new();

    let greeting = heap.string("hello, pdumper");
    let greeting_tv = heap.tagged(greeting);

    // A list whose first two cells share the same string and whose
    // third cell's cdr is patched to point back at the first, forming a
    // cycle the locality queue must still terminate on.
    let tail = heap.cons(greeting_tv, TaggedValue::new(0, Tag::Int));
    let middle = heap.cons(greeting_tv, heap.tagged(tail));
    let head = heap.cons(greeting_tv, heap.tagged(middle));
    heap.set_cdr(tail, heap.tagged(head));

    let pi = heap.float(std::f64::consts::PI);
    let vector = heap.vector(vec![heap.tagged(head), heap.tagged(pi), Heap::fixnum(42)]);

    let table = heap.hash_table(
        "eql",
        vec![
            (Heap::fixnum(1), heap.tagged(greeting)),
            (heap.tagged(pi), heap.tagged(vector)),
        ],
    );

    let sym_name = heap.string("demo-symbol");
    let symbol = heap.symbol(
        heap.tagged(sym_name),
        heap.tagged(table),
        Heap::fixnum(0),
        TaggedValue::new(0, Tag::Int),
    );

    heap.add_root(heap.tagged(head));
    heap.add_root(heap.tagged(vector));
    heap.add_root(heap.tagged(symbol));
    heap
}

impl TypeOracle for Heap {
    fn pseudovector_kind(&self, value: TaggedValue) -> PVecKind {
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::HashTable { .. } => PVecKind::HashTable,
            _ => PVecKind::Generic,
        }
    }

    fn is_builtin_symbol(&self, _value: TaggedValue) -> bool {
        false
    }

    fn size_of(&self, value: TaggedValue) -> usize {
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::Cons { .. } => 16,
            Obj::Str(bytes) => 16 + bytes.len() + 1,
            Obj::Float(_) => 8,
            Obj::Symbol { .. } => 48,
            Obj::Vector(slots) => 8 + 8 * slots.len(),
            Obj::HashTable { pairs, .. } => 8 + 16 * pairs.len(),
        }
    }

    fn host_offset(&self, _value: TaggedValue) -> Option<HostOff> {
        None
    }

    fn type_name(&self, value: TaggedValue) -> &'static str {
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::Cons { .. } => "cons",
            Obj::Str(_) => "string",
            Obj::Float(_) => "float",
            Obj::Symbol { .. } => "symbol",
            Obj::Vector(_) => "vector",
            Obj::HashTable { .. } => "hash-table",
        }
    }

    fn value_of(&self, obj: ObjectId) -> TaggedValue {
        let tag = match &self.objects[obj.0 as usize] {
            Obj::Cons { .. } => Tag::Cons,
            Obj::Str(_) => Tag::String,
            Obj::Float(_) => Tag::Float,
            Obj::Symbol { .. } => Tag::Symbol,
            Obj::Vector(_) | Obj::HashTable { .. } => Tag::Vectorlike,
        };
        TaggedValue::new(obj.0, tag)
    }

    fn layout_descriptor(&self) -> LayoutDescriptor {
        LayoutDescriptor {
            type_layouts: vec![
                "cons: 16 bytes, fields car@0, cdr@8".into(),
                "string: 16 bytes header, fields len@0, data@8".into(),
                "float: 8 bytes, value@0".into(),
                "symbol: 48 bytes, fields name@0, redirect@8, value@16, function@24, plist@32, next@40".into(),
                "vector: 8 bytes header + 8 bytes per slot".into(),
                "hash-table: 8 bytes header + 16 bytes per pair".into(),
            ],
        }
    }
}

impl HeapFields for Heap {
    fn cons_car(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Cons { car, .. } => *car,
            _ => unreachable!("not a cons"),
        }
    }

    fn cons_cdr(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Cons { cdr, .. } => *cdr,
            _ => unreachable!("not a cons"),
        }
    }

    fn string_bytes(&self, obj: ObjectId) -> &[u8] {
        match &self.objects[obj.0 as usize] {
            Obj::Str(bytes) => bytes,
            _ => unreachable!("not a string"),
        }
    }

    fn string_host_data(&self, _obj: ObjectId) -> Option<HostOff> {
        // Every string in this toy heap is heap-allocated; none are
        // baked into a host image.
        None
    }

    fn float_value(&self, obj: ObjectId) -> f64 {
        match &self.objects[obj.0 as usize] {
            Obj::Float(value) => *value,
            _ => unreachable!("not a float"),
        }
    }

    fn symbol_name(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Symbol { name, .. } => *name,
            _ => unreachable!("not a symbol"),
        }
    }

    fn symbol_redirect(&self, _obj: ObjectId) -> SymbolRedirect {
        // The demo interpreter never models buffer-local or aliased
        // variables, only a symbol's own plain value cell.
        SymbolRedirect::PlainValue
    }

    fn symbol_plain_value(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Symbol { value, .. } => *value,
            _ => unreachable!("not a symbol"),
        }
    }

    fn symbol_alias_target(&self, _obj: ObjectId) -> ObjectId {
        unreachable!("symbol_redirect is always PlainValue")
    }

    fn symbol_localized_aux(&self, _obj: ObjectId) -> Vec<u8> {
        unreachable!("symbol_redirect is always PlainValue")
    }

    fn symbol_forwarded_host_offset(&self, _obj: ObjectId) -> HostOff {
        unreachable!("symbol_redirect is always PlainValue")
    }

    fn symbol_function(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Symbol { function, .. } => *function,
            _ => unreachable!("not a symbol"),
        }
    }

    fn symbol_plist(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Symbol { plist, .. } => *plist,
            _ => unreachable!("not a symbol"),
        }
    }

    fn symbol_next(&self, obj: ObjectId) -> Option<ObjectId> {
        match &self.objects[obj.0 as usize] {
            Obj::Symbol { next, .. } => *next,
            _ => unreachable!("not a symbol"),
        }
    }

    fn bignum_negative(&self, _obj: ObjectId) -> bool {
        unreachable!("the demo heap never constructs a bignum")
    }

    fn bignum_limbs(&self, _obj: ObjectId) -> &[u32] {
        unreachable!("the demo heap never constructs a bignum")
    }

    fn vector_slots(&self, obj: ObjectId) -> &[TaggedValue] {
        match &self.objects[obj.0 as usize] {
            Obj::Vector(slots) => slots,
            _ => unreachable!("not a vector"),
        }
    }

    fn vector_tail_bytes(&self, _obj: ObjectId) -> &[u8] {
        &[]
    }

    fn hash_table_pairs(&self, obj: ObjectId) -> &[(TaggedValue, TaggedValue)] {
        match &self.objects[obj.0 as usize] {
            Obj::HashTable { pairs, .. } => pairs,
            _ => unreachable!("not a hash table"),
        }
    }

    fn hash_table_test_name(&self, obj: ObjectId) -> &str {
        match &self.objects[obj.0 as usize] {
            Obj::HashTable { test, .. } => test,
            _ => unreachable!("not a hash table"),
        }
    }

    fn marker_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!("the demo heap never constructs a marker")
    }

    fn marker_next(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!("the demo heap never constructs a marker")
    }

    fn marker_bytepos(&self, _obj: ObjectId) -> i64 {
        unreachable!("the demo heap never constructs a marker")
    }

    fn marker_charpos(&self, _obj: ObjectId) -> i64 {
        unreachable!("the demo heap never constructs a marker")
    }

    fn overlay_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!("the demo heap never constructs an overlay")
    }

    fn overlay_start(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs an overlay")
    }

    fn overlay_end(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs an overlay")
    }

    fn overlay_plist(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs an overlay")
    }

    fn finalizer_function(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs a finalizer")
    }

    fn finalizer_prev(&self, _obj: ObjectId) -> FinalizerLink {
        unreachable!("the demo heap never constructs a finalizer")
    }

    fn finalizer_next(&self, _obj: ObjectId) -> FinalizerLink {
        unreachable!("the demo heap never constructs a finalizer")
    }

    fn buffer_text_bytes(&self, _obj: ObjectId) -> &[u8] {
        unreachable!("the demo heap never constructs a buffer")
    }

    fn buffer_base_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!("the demo heap never constructs a buffer")
    }

    fn buffer_markers(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!("the demo heap never constructs a buffer")
    }

    fn buffer_local_slots(&self, _obj: ObjectId) -> &[TaggedValue] {
        unreachable!("the demo heap never constructs a buffer")
    }

    fn buffer_has_overlays(&self, _obj: ObjectId) -> bool {
        unreachable!("the demo heap never constructs a buffer")
    }

    fn subr_origin(&self, _obj: ObjectId) -> SubrOrigin {
        unreachable!("the demo heap never constructs a subr")
    }

    fn subr_symbol_name(&self, _obj: ObjectId) -> &[u8] {
        unreachable!("the demo heap never constructs a subr")
    }

    fn comp_unit_file_name(&self, _obj: ObjectId) -> &[u8] {
        unreachable!("the demo heap never constructs a native compilation unit")
    }

    fn query_language(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs a compiled query")
    }

    fn query_source(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("the demo heap never constructs a compiled query")
    }

    fn remembered_scalar_bytes(&self, _host_offset: HostOff, _nbytes: usize) -> Vec<u8> {
        unreachable!("the demo heap registers no remembered locations")
    }

    fn remembered_tagged_ptr_value(&self, _host_offset: HostOff) -> TaggedValue {
        unreachable!("the demo heap registers no remembered locations")
    }
}

impl Reflect for Heap {
    fn visit_roots(&self, visit: &mut dyn FnMut(TaggedValue, RootKind)) {
        for root in &self.roots {
            visit(*root, RootKind::Other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_heap_round_trips_through_value_of() {
        let heap = demo_heap();
        assert!(heap.len() >= 8);
        for id in 0..heap.len() as u64 {
            let value = heap.value_of(ObjectId(id));
            assert_eq!(value.as_object_id(), ObjectId(id));
        }
    }

    #[test]
    fn cyclic_list_cdr_points_back_at_the_head() {
        let mut heap = Heap::new();
        let a = heap.cons(Heap::fixnum(1), Heap::fixnum(0));
        let b = heap.cons(Heap::fixnum(2), heap.tagged(a));
        heap.set_cdr(a, heap.tagged(b));
        assert_eq!(heap.cons_cdr(a).as_object_id(), b);
        assert_eq!(heap.cons_cdr(b).as_object_id(), a);
    }

    /// `layout_descriptor()` stands in for the build-time `CHECK_STRUCTS`
    /// layout hash: a change to a dumped type's field order or size must
    /// show up here, in source control, rather than silently changing the
    /// fingerprint and only failing cross-build loads at runtime.
    #[test]
    fn layout_descriptor_matches_golden_snapshot() {
        let heap = Heap::new();
        let descriptor = heap.layout_descriptor();
        let golden = vec![
            "cons: 16 bytes, fields car@0, cdr@8".to_string(),
            "string: 16 bytes header, fields len@0, data@8".to_string(),
            "float: 8 bytes, value@0".to_string(),
            "symbol: 48 bytes, fields name@0, redirect@8, value@16, function@24, plist@32, next@40".to_string(),
            "vector: 8 bytes header + 8 bytes per slot".to_string(),
            "hash-table: 8 bytes header + 16 bytes per pair".to_string(),
        ];
        assert_eq!(descriptor.type_layouts, golden);
    }
}
