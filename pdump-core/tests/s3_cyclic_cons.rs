//! Scenario S3 (spec §8): a cons whose cdr points back at itself. The
//! forward reference is resolved by `resolve_fixups` once the cons has
//! a final offset, without the writer ever blocking on the cycle.

mod common;

use common::*;
use pdump_core::value::Tag;
use pdump_core::NoBignumReloader;

#[test]
fn cyclic_cdr_resolves_to_its_own_offset() {
    let mut heap = TestHeap::new();
    let cons = heap.cons(TestHeap::fixnum(7), TestHeap::fixnum(0));
    heap.set_cdr(cons, heap.tagged(cons));
    heap.add_root(heap.tagged(cons));

    let fingerprint = heap.fingerprint();
    let dir = tempfile::tempdir().unwrap();
    let (path, stats) = dump_to_file(&heap, fingerprint, dir.path());
    assert_eq!(stats.nr_object_starts, 1);

    load_dump(path, fingerprint, &mut NoBignumReloader);
    let guard = pdump_core::loaded().unwrap().lock().unwrap();
    let bytes = guard.dump_bytes();
    let dump_base = guard.dump_base();

    let starts = object_start_offsets(&guard);
    assert_eq!(starts.len(), 1);
    let start = starts[0];

    let car = read_u64(bytes, start);
    assert_eq!(decode_word(car), (Tag::Int, 7));

    let cdr = read_u64(bytes, start + 8);
    let (cdr_tag, cdr_abs) = decode_word(cdr);
    assert_eq!(cdr_tag, Tag::Cons);
    assert_eq!((cdr_abs - dump_base) as i32, start, "cdr must point back at the same cons");
}
