//! Scenario S6 (spec §8): a hash table nested inside another hash
//! table. Both are deferred off the main locality queue and written
//! only after every ordinary object has a final offset, and the nested
//! table drains one batch after its parent since discovering it is
//! itself a side effect of writing the parent.

mod common;

use common::*;
use pdump_core::value::Tag;
use pdump_core::NoBignumReloader;

#[test]
fn nested_hash_tables_drain_after_ordinary_objects() {
    let mut heap = TestHeap::new();
    let inner = heap.hash_table("eql", vec![(TestHeap::fixnum(1), TestHeap::fixnum(2))]);
    let outer = heap.hash_table("eql", vec![(TestHeap::fixnum(9), heap.tagged(inner))]);
    let plain_cons = heap.cons(TestHeap::fixnum(3), TestHeap::fixnum(4));
    heap.add_root(heap.tagged(outer));
    heap.add_root(heap.tagged(plain_cons));

    let fingerprint = heap.fingerprint();
    let dir = tempfile::tempdir().unwrap();
    let (path, stats) = dump_to_file(&heap, fingerprint, dir.path());
    assert_eq!(stats.nr_hash_tables, 2);
    // plain_cons + outer table + inner table.
    assert_eq!(stats.nr_object_starts, 3);

    load_dump(path, fingerprint, &mut NoBignumReloader);
    let guard = pdump_core::loaded().unwrap().lock().unwrap();
    let bytes = guard.dump_bytes();
    let dump_base = guard.dump_base();

    let starts = object_start_offsets(&guard);
    let table_offsets = hash_table_offsets(&guard, 2);
    assert_eq!(table_offsets.len(), 2);

    let cons_start = *starts
        .iter()
        .find(|&&off| !table_offsets.contains(&off))
        .expect("the plain cons is not one of the hash tables");

    for &table_off in &table_offsets {
        assert!(
            table_off > cons_start,
            "hash tables must drain after every ordinary hot-queue object"
        );
    }
    assert!(
        table_offsets[1] > table_offsets[0],
        "the nested table is discovered while writing its parent, so it drains one batch later"
    );

    let outer_off = table_offsets[0];
    let inner_off = table_offsets[1];

    let pair_count = read_u64(bytes, outer_off + 8);
    assert_eq!(pair_count, 1);
    let key = read_u64(bytes, outer_off + 16);
    assert_eq!(decode_word(key), (Tag::Int, 9));
    let value = read_u64(bytes, outer_off + 24);
    let (value_tag, value_abs) = decode_word(value);
    assert_eq!(value_tag, Tag::Vectorlike);
    assert_eq!((value_abs - dump_base) as i32, inner_off);
}
