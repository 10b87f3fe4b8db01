//! Shared harness for the round-trip scenario tests (spec §8, S1-S6):
//! a small in-memory heap supporting every type the scenarios exercise
//! (cons, string, float, bignum, hash table, built-in symbol), a
//! `HostImage` stand-in modeled after a growable byte buffer, and the
//! raw-byte decoders the scenarios use to inspect a loaded dump without
//! a second copy of the writer/loader's own field layouts.

#![allow(dead_code)]

use std::sync::Mutex as StdMutex;

use std::path::{Path, PathBuf};

use pdump_core::loader::HostImage;
use pdump_core::value::{
    HostOff, LayoutDescriptor, ObjectId, PVecKind, Reflect, RootKind, Tag, TaggedValue, TypeOracle,
};
use pdump_core::{
    BignumReloader, DumpConfig, DumpStats, FinalizerLink, Fingerprint, HeapFields, HookRegistry, LoadConfig,
    LoadedDump, NoNativeLoader, RememberedData, SubrOrigin,
};

/// Host offset of the first registered built-in symbol; kept well above
/// any plausible `ObjectId` so `value_of`/`host_offset` can tell built-in
/// symbols apart from ordinary heap objects by payload alone.
const BUILTIN_BASE: u64 = 1 << 40;

#[derive(Clone)]
enum Obj {
    Cons { car: TaggedValue, cdr: TaggedValue },
    Str(Vec<u8>),
    Float(f64),
    Bignum { negative: bool, limbs: Vec<u32> },
    HashTable { test: String, pairs: Vec<(TaggedValue, TaggedValue)> },
}

/// A toy managed heap exercising every type the round-trip scenarios
/// need, plus built-in (host-resident) symbols `pdump-cli`'s demo heap
/// never constructs.
pub struct TestHeap {
    objects: Vec<Obj>,
    roots: Vec<TaggedValue>,
    builtin_offsets: Vec<HostOff>,
}

impl TestHeap {
    pub fn new() -> Self {
        TestHeap {
            objects: Vec::new(),
            roots: Vec::new(),
            builtin_offsets: Vec::new(),
        }
    }

    pub fn fixnum(v: i64) -> TaggedValue {
        TaggedValue::new(v as u64, Tag::Int)
    }

    fn push(&mut self, obj: Obj) -> ObjectId {
        let id = ObjectId(self.objects.len() as u64);
        self.objects.push(obj);
        id
    }

    pub fn tagged(&self, id: ObjectId) -> TaggedValue {
        self.value_of(id)
    }

    pub fn cons(&mut self, car: TaggedValue, cdr: TaggedValue) -> ObjectId {
        self.push(Obj::Cons { car, cdr })
    }

    pub fn set_cdr(&mut self, id: ObjectId, cdr: TaggedValue) {
        match &mut self.objects[id.0 as usize] {
            Obj::Cons { cdr: slot, .. } => *slot = cdr,
            _ => panic!("not a cons"),
        }
    }

    pub fn string(&mut self, bytes: impl Into<Vec<u8>>) -> ObjectId {
        self.push(Obj::Str(bytes.into()))
    }

    pub fn float(&mut self, v: f64) -> ObjectId {
        self.push(Obj::Float(v))
    }

    pub fn bignum(&mut self, negative: bool, limbs: Vec<u32>) -> ObjectId {
        self.push(Obj::Bignum { negative, limbs })
    }

    pub fn hash_table(&mut self, test: impl Into<String>, pairs: Vec<(TaggedValue, TaggedValue)>) -> ObjectId {
        self.push(Obj::HashTable { test: test.into(), pairs })
    }

    /// Register a symbol that lives entirely in the host image at
    /// `host_offset` — `nil`, `t`, a keyword baked into the binary.
    pub fn builtin_symbol(&mut self, host_offset: HostOff) -> TaggedValue {
        let idx = self.builtin_offsets.len() as u64;
        self.builtin_offsets.push(host_offset);
        TaggedValue::new(BUILTIN_BASE + idx, Tag::Symbol)
    }

    pub fn add_root(&mut self, v: TaggedValue) {
        self.roots.push(v);
    }

    /// A fingerprint derived from this heap's own layout descriptor — the
    /// exact crate version string is irrelevant here since the only
    /// consumer is the `fingerprint_ok` closure the same test hands to
    /// `load`, never a second binary's build.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.layout_descriptor(), "test-harness")
    }

    fn is_builtin(&self, value: TaggedValue) -> bool {
        value.tag() == Tag::Symbol && value.payload() >= BUILTIN_BASE
    }
}

impl TypeOracle for TestHeap {
    fn pseudovector_kind(&self, value: TaggedValue) -> PVecKind {
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::HashTable { .. } => PVecKind::HashTable,
            Obj::Bignum { .. } => PVecKind::Bignum,
            _ => PVecKind::Generic,
        }
    }

    fn is_builtin_symbol(&self, value: TaggedValue) -> bool {
        self.is_builtin(value)
    }

    fn size_of(&self, value: TaggedValue) -> usize {
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::Cons { .. } => 16,
            Obj::Str(bytes) => 16 + bytes.len() + 1,
            Obj::Float(_) => 8,
            Obj::Bignum { limbs, .. } => 16 + 4 * limbs.len(),
            Obj::HashTable { pairs, .. } => 16 + 16 * pairs.len(),
        }
    }

    fn host_offset(&self, value: TaggedValue) -> Option<HostOff> {
        if self.is_builtin(value) {
            let idx = (value.payload() - BUILTIN_BASE) as usize;
            Some(self.builtin_offsets[idx])
        } else {
            None
        }
    }

    fn type_name(&self, value: TaggedValue) -> &'static str {
        if self.is_builtin(value) {
            return "builtin-symbol";
        }
        match &self.objects[value.as_object_id().0 as usize] {
            Obj::Cons { .. } => "cons",
            Obj::Str(_) => "string",
            Obj::Float(_) => "float",
            Obj::Bignum { .. } => "bignum",
            Obj::HashTable { .. } => "hash-table",
        }
    }

    fn value_of(&self, obj: ObjectId) -> TaggedValue {
        if obj.0 >= BUILTIN_BASE {
            return TaggedValue::new(obj.0, Tag::Symbol);
        }
        let tag = match &self.objects[obj.0 as usize] {
            Obj::Cons { .. } => Tag::Cons,
            Obj::Str(_) => Tag::String,
            Obj::Float(_) => Tag::Float,
            Obj::Bignum { .. } | Obj::HashTable { .. } => Tag::Vectorlike,
        };
        TaggedValue::new(obj.0, tag)
    }

    fn layout_descriptor(&self) -> LayoutDescriptor {
        LayoutDescriptor {
            type_layouts: vec!["test-heap: cons/string/float/bignum/hash-table".into()],
        }
    }
}

impl HeapFields for TestHeap {
    fn cons_car(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Cons { car, .. } => *car,
            _ => panic!("not a cons"),
        }
    }
    fn cons_cdr(&self, obj: ObjectId) -> TaggedValue {
        match &self.objects[obj.0 as usize] {
            Obj::Cons { cdr, .. } => *cdr,
            _ => panic!("not a cons"),
        }
    }

    fn string_bytes(&self, obj: ObjectId) -> &[u8] {
        match &self.objects[obj.0 as usize] {
            Obj::Str(bytes) => bytes,
            _ => panic!("not a string"),
        }
    }
    fn string_host_data(&self, _obj: ObjectId) -> Option<HostOff> {
        None
    }

    fn float_value(&self, obj: ObjectId) -> f64 {
        match &self.objects[obj.0 as usize] {
            Obj::Float(v) => *v,
            _ => panic!("not a float"),
        }
    }

    fn symbol_name(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!("TestHeap never dumps a heap-resident symbol object")
    }
    fn symbol_redirect(&self, _obj: ObjectId) -> pdump_core::value::SymbolRedirect {
        unreachable!()
    }
    fn symbol_plain_value(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn symbol_alias_target(&self, _obj: ObjectId) -> ObjectId {
        unreachable!()
    }
    fn symbol_localized_aux(&self, _obj: ObjectId) -> Vec<u8> {
        unreachable!()
    }
    fn symbol_forwarded_host_offset(&self, _obj: ObjectId) -> HostOff {
        unreachable!()
    }
    fn symbol_function(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn symbol_plist(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn symbol_next(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }

    fn bignum_negative(&self, obj: ObjectId) -> bool {
        match &self.objects[obj.0 as usize] {
            Obj::Bignum { negative, .. } => *negative,
            _ => panic!("not a bignum"),
        }
    }
    fn bignum_limbs(&self, obj: ObjectId) -> &[u32] {
        match &self.objects[obj.0 as usize] {
            Obj::Bignum { limbs, .. } => limbs,
            _ => panic!("not a bignum"),
        }
    }

    fn vector_slots(&self, _obj: ObjectId) -> &[TaggedValue] {
        unreachable!("TestHeap never constructs a generic vector")
    }
    fn vector_tail_bytes(&self, _obj: ObjectId) -> &[u8] {
        unreachable!()
    }

    fn hash_table_pairs(&self, obj: ObjectId) -> &[(TaggedValue, TaggedValue)] {
        match &self.objects[obj.0 as usize] {
            Obj::HashTable { pairs, .. } => pairs,
            _ => panic!("not a hash table"),
        }
    }
    fn hash_table_test_name(&self, obj: ObjectId) -> &str {
        match &self.objects[obj.0 as usize] {
            Obj::HashTable { test, .. } => test,
            _ => panic!("not a hash table"),
        }
    }

    fn marker_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }
    fn marker_next(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }
    fn marker_bytepos(&self, _obj: ObjectId) -> i64 {
        unreachable!()
    }
    fn marker_charpos(&self, _obj: ObjectId) -> i64 {
        unreachable!()
    }

    fn overlay_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }
    fn overlay_start(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn overlay_end(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn overlay_plist(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }

    fn finalizer_function(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn finalizer_prev(&self, _obj: ObjectId) -> FinalizerLink {
        unreachable!()
    }
    fn finalizer_next(&self, _obj: ObjectId) -> FinalizerLink {
        unreachable!()
    }

    fn buffer_text_bytes(&self, _obj: ObjectId) -> &[u8] {
        unreachable!()
    }
    fn buffer_base_buffer(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }
    fn buffer_markers(&self, _obj: ObjectId) -> Option<ObjectId> {
        unreachable!()
    }
    fn buffer_local_slots(&self, _obj: ObjectId) -> &[TaggedValue] {
        unreachable!()
    }
    fn buffer_has_overlays(&self, _obj: ObjectId) -> bool {
        unreachable!()
    }

    fn subr_origin(&self, _obj: ObjectId) -> SubrOrigin {
        unreachable!()
    }
    fn subr_symbol_name(&self, _obj: ObjectId) -> &[u8] {
        unreachable!()
    }

    fn comp_unit_file_name(&self, _obj: ObjectId) -> &[u8] {
        unreachable!()
    }

    fn query_language(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }
    fn query_source(&self, _obj: ObjectId) -> TaggedValue {
        unreachable!()
    }

    fn remembered_scalar_bytes(&self, _host_offset: HostOff, _nbytes: usize) -> Vec<u8> {
        unreachable!()
    }
    fn remembered_tagged_ptr_value(&self, _host_offset: HostOff) -> TaggedValue {
        unreachable!()
    }
}

impl Reflect for TestHeap {
    fn visit_roots(&self, visit: &mut dyn FnMut(TaggedValue, RootKind)) {
        for &root in &self.roots {
            visit(root, RootKind::Other);
        }
    }
}

/// A `HostImage` modeled as a growable byte buffer, `host_basis() == 0`,
/// composing tagged values with the exact bit layout
/// `TaggedValue::encode_inline` uses — so a decoded word is comparable
/// across both self-representing and relocated fields.
pub struct TestHost {
    bytes: StdMutex<Vec<u8>>,
}

impl TestHost {
    pub fn new(len: usize) -> Self {
        TestHost {
            bytes: StdMutex::new(vec![0u8; len]),
        }
    }
}

impl HostImage for TestHost {
    fn host_basis(&self) -> i64 {
        0
    }

    fn write_at(&mut self, offset: HostOff, bytes: &[u8]) {
        let mut guard = self.bytes.lock().unwrap();
        let at = offset as usize;
        if guard.len() < at + bytes.len() {
            guard.resize(at + bytes.len(), 0);
        }
        guard[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn compose_tagged(&self, absolute_addr: i64, tag: Tag) -> u64 {
        (absolute_addr as u64 & 0x00ff_ffff_ffff_ffff) | ((tag as u64) << 56)
    }
}

/// Decode an 8-byte tagged word the same way `TaggedValue::decode_inline`
/// would — valid both for a self-representing inline value and for a
/// word a dump/host relocation composed via `TestHost::compose_tagged`.
pub fn decode_word(word: u64) -> (Tag, i64) {
    let tag = Tag::from_index((word >> 56) as u8).unwrap_or(Tag::Int);
    ((tag), (word & 0x00ff_ffff_ffff_ffff) as i64)
}

pub fn read_u64(bytes: &[u8], at: i32) -> u64 {
    let at = at as usize;
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

pub fn read_i64(bytes: &[u8], at: i32) -> i64 {
    read_u64(bytes, at) as i64
}

pub fn read_u32(bytes: &[u8], at: i32) -> u32 {
    let at = at as usize;
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

pub fn read_i32(bytes: &[u8], at: i32) -> i32 {
    read_u32(bytes, at) as i32
}

/// Decode the object-starts table into a plain `Vec` of dump offsets.
pub fn object_start_offsets(dump: &LoadedDump) -> Vec<i32> {
    let locator = dump.header().object_starts;
    let bytes = dump.dump_bytes();
    (0..locator.entry_count)
        .map(|i| read_i32(bytes, locator.offset + i * 4))
        .collect()
}

/// Decode the dumped-hash-tables table (`header.hash_list`) into the
/// dump offsets of every hash table written, in the order they drained
/// off the deferred queue.
pub fn hash_table_offsets(dump: &LoadedDump, count: usize) -> Vec<i32> {
    let bytes = dump.dump_bytes();
    let start = dump.header().hash_list;
    (0..count as i32).map(|i| read_i32(bytes, start + i * 4)).collect()
}

/// Dump `heap` to a fresh file under `dir`, returning the path and the
/// writer's own bookkeeping stats.
pub fn dump_to_file(heap: &TestHeap, fingerprint: Fingerprint, dir: &Path) -> (PathBuf, DumpStats) {
    let remembered = RememberedData::new();
    let output = pdump_core::dump(heap, heap, &remembered, DumpConfig::default(), fingerprint).unwrap();
    let path = dir.join("scenario.pdump");
    pdump_core::write_dump_file(&path, &output).unwrap();
    (path, output.stats)
}

/// Load `path` into this process's singleton `LoadedDump`, installing it
/// for the rest of the test binary's lifetime (a process loads at most
/// one dump, so each scenario gets its own test binary/file).
pub fn load_dump(path: PathBuf, fingerprint: Fingerprint, bignums: &mut dyn BignumReloader) {
    let config = LoadConfig { path, argv0: None };
    let mut host = TestHost::new(1 << 16);
    let hooks = HookRegistry::new();
    pdump_core::load(&config, |fp| fp == fingerprint, &mut host, &NoNativeLoader, bignums, &hooks)
        .expect("dump should load cleanly");
}
