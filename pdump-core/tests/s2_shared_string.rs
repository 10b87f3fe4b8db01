//! Scenario S2 (spec §8): a cons whose car and cdr both point at the
//! same string. The string body is written exactly once; both fields
//! resolve to the same dump-to-dump relocation target.

mod common;

use common::*;
use pdump_core::value::Tag;
use pdump_core::NoBignumReloader;

#[test]
fn shared_string_is_written_once() {
    let mut heap = TestHeap::new();
    let s = heap.string(*b"hello");
    let cons = heap.cons(heap.tagged(s), heap.tagged(s));
    heap.add_root(heap.tagged(cons));

    let fingerprint = heap.fingerprint();
    let dir = tempfile::tempdir().unwrap();
    let (path, stats) = dump_to_file(&heap, fingerprint, dir.path());

    // One cons, one string body - never two.
    assert_eq!(stats.nr_object_starts, 2);

    load_dump(path, fingerprint, &mut NoBignumReloader);
    let guard = pdump_core::loaded().unwrap().lock().unwrap();
    let bytes = guard.dump_bytes();
    let dump_base = guard.dump_base();

    let starts = object_start_offsets(&guard);
    let cons_start = *starts
        .iter()
        .find(|&&off| {
            let car = read_u64(bytes, off);
            let cdr = read_u64(bytes, off + 8);
            let (car_tag, car_off) = decode_word(car);
            let (cdr_tag, cdr_off) = decode_word(cdr);
            car_tag == Tag::String && cdr_tag == Tag::String && car_off == cdr_off
        })
        .expect("cons with two equal string-tagged fields");

    let car = read_u64(bytes, cons_start);
    let cdr = read_u64(bytes, cons_start + 8);
    let (_, car_target) = decode_word(car);
    let (_, cdr_target) = decode_word(cdr);
    assert_eq!(car_target, cdr_target, "both fields must share one string object");

    let string_start = (car_target - dump_base) as i32;
    let len = read_u64(bytes, string_start);
    assert_eq!(len, 5);
    let data_ptr = read_i64(bytes, string_start + 8);
    let data_off = (data_ptr - dump_base) as usize;
    assert_eq!(&bytes[data_off..data_off + 6], b"hello\0");
}
