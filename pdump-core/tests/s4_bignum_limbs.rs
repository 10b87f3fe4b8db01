//! Scenario S4 (spec §8): a bignum holding 2^200 + 1. Its header lands
//! in the hot section; its limbs land in the cold section; the
//! `Bignum` dump-relocation hands the host an absolute limb pointer
//! plus a limb count rather than touching the dump bytes itself.

mod common;

use common::*;

struct RecordingBignumReloader {
    seen: Option<(i64, u32)>,
}

impl pdump_core::BignumReloader for RecordingBignumReloader {
    fn reload_bignum(&mut self, limb_ptr: i64, n_limbs: u32) {
        self.seen = Some((limb_ptr, n_limbs));
    }
}

#[test]
fn bignum_limbs_round_trip() {
    // 2^200 + 1 as seven little-endian 32-bit limbs: bit 200 is limb
    // index 200/32 = 6, bit offset 200%32 = 8, so limb 6 holds 1 << 8.
    let limbs = vec![1u32, 0, 0, 0, 0, 0, 1 << 8];

    let mut heap = TestHeap::new();
    let big = heap.bignum(false, limbs.clone());
    heap.add_root(heap.tagged(big));

    let fingerprint = heap.fingerprint();
    let dir = tempfile::tempdir().unwrap();
    let (path, stats) = dump_to_file(&heap, fingerprint, dir.path());
    assert_eq!(stats.nr_object_starts, 1);

    let mut reloader = RecordingBignumReloader { seen: None };
    load_dump(path, fingerprint, &mut reloader);
    let guard = pdump_core::loaded().unwrap().lock().unwrap();
    let bytes = guard.dump_bytes();
    let dump_base = guard.dump_base();

    let starts = object_start_offsets(&guard);
    assert_eq!(starts.len(), 1);
    let negative_byte = bytes[starts[0] as usize];
    assert_eq!(negative_byte, 0, "this bignum is positive");

    let (limb_ptr, n_limbs) = reloader.seen.expect("BignumReloader must have been invoked");
    assert_eq!(n_limbs as usize, limbs.len());

    let limb_start = (limb_ptr - dump_base) as i32;
    let mut read_back = Vec::with_capacity(limbs.len());
    for i in 0..limbs.len() as i32 {
        read_back.push(read_u32(bytes, limb_start + i * 4));
    }
    assert_eq!(read_back, limbs);
}
