//! Scenario S5 (spec §8): a cons referencing a built-in symbol. The
//! symbol itself is never enqueued or written — the reference resolves
//! straight to a `DumpToHostLv` relocation pointing at the symbol's
//! fixed host offset, distinguishable from a `DumpToDumpLv` target
//! (which would carry `dump_base + offset`, not the bare host offset)
//! by the fact that `TestHost::host_basis()` is zero.

mod common;

use common::*;
use pdump_core::value::Tag;
use pdump_core::NoBignumReloader;

#[test]
fn builtin_symbol_resolves_to_host_relocation() {
    let mut heap = TestHeap::new();
    let sym = heap.builtin_symbol(2000);
    let cons = heap.cons(sym, TestHeap::fixnum(99));
    heap.add_root(heap.tagged(cons));

    let fingerprint = heap.fingerprint();
    let dir = tempfile::tempdir().unwrap();
    let (path, stats) = dump_to_file(&heap, fingerprint, dir.path());

    // The built-in symbol is host-resident: only the cons gets an
    // object slot.
    assert_eq!(stats.nr_object_starts, 1);

    load_dump(path, fingerprint, &mut NoBignumReloader);
    let guard = pdump_core::loaded().unwrap().lock().unwrap();
    let bytes = guard.dump_bytes();

    let starts = object_start_offsets(&guard);
    assert_eq!(starts.len(), 1);

    let car = read_u64(bytes, starts[0]);
    let (tag, payload) = decode_word(car);
    assert_eq!(tag, Tag::Symbol);
    // host_basis() is 0, so a DumpToHostLv composition leaves the bare
    // host offset in place; a DumpToDumpLv composition would instead
    // show `dump_base + something`, which is never this small.
    assert_eq!(payload, 2000);

    let cdr = read_u64(bytes, starts[0] + 8);
    assert_eq!(decode_word(cdr), (Tag::Int, 99));
}
