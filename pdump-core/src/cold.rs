//! Cold-section writers: bulk blobs that are never relocated after load.
//!
//! A cold op is remembered while the owning object is written in the hot
//! or discardable section (its header gets a placeholder data pointer and
//! a [`crate::fixup::Fixup`]) and is only materialized once every other
//! object has a final offset — mirroring the original's `dump_remember_
//! cold_op`/`dump_cold_string` split. Cold blobs are written with
//! [`crate::buffer::DumpBuffer::append_raw`], not `object_start`/
//! `object_finish`: they have no header, no alignment beyond what their
//! own type needs, and are frequently larger than the 2048-byte sanity
//! bound that applies to ordinary dumped objects.

use std::collections::HashMap;

use crate::buffer::DumpBuffer;
use crate::error::PdumpError;
use crate::header::round_up_to_page;
use crate::value::{DumpOff, ObjectId};

/// One pending bulk blob, keyed by the object whose header will be
/// patched to point at it once it is written.
pub enum ColdOp {
    /// String bytes, buffer text, a native-subr's symbol name, or any
    /// other plain byte blob. NUL-terminated the way the original always
    /// adds a trailing byte to string/buffer data, so a raw C string
    /// accessor keeps working against the mapped dump.
    Bytes { owner: ObjectId, bytes: Vec<u8> },
    /// An arbitrary-precision integer's backing limbs, aligned to the
    /// limb size (4 bytes, since we store 32-bit limbs) rather than
    /// `DUMP_ALIGNMENT`.
    Limbs { owner: ObjectId, limbs: Vec<u32> },
}

impl ColdOp {
    fn owner(&self) -> ObjectId {
        match self {
            ColdOp::Bytes { owner, .. } => *owner,
            ColdOp::Limbs { owner, .. } => *owner,
        }
    }
}

/// Where each cold op's blob landed, and (for limb blobs) how many limbs
/// it holds — consumed by the fixup resolver via
/// [`crate::fixup::FixupOracle::bignum_reload_info`] and by plain
/// `PtrDumpRaw` fixups for byte blobs.
#[derive(Default)]
pub struct ColdLocations {
    pub bytes: HashMap<ObjectId, DumpOff>,
    pub limbs: HashMap<ObjectId, (DumpOff, u32)>,
}

/// Round `buffer`'s cursor up to the worst-case page size and write every
/// queued cold op, in the order given (the writer enqueues them in
/// deferred-cold-queue drain order). Returns the page-aligned start of the
/// cold section and the blob locations the fixup resolver needs.
pub fn emit_cold_section(
    buffer: &mut DumpBuffer,
    ops: Vec<ColdOp>,
    worst_case_page_size: usize,
) -> Result<(DumpOff, ColdLocations), PdumpError> {
    buffer.align_raw(worst_case_page_size)?;
    debug_assert_eq!(
        round_up_to_page(buffer.offset(), worst_case_page_size as i32),
        buffer.offset(),
    );
    let cold_start = buffer.offset();

    let mut locations = ColdLocations::default();
    for op in ops {
        let owner = op.owner();
        match op {
            ColdOp::Bytes { bytes, .. } => {
                let at = buffer.append_raw(&bytes)?;
                locations.bytes.insert(owner, at);
            }
            ColdOp::Limbs { limbs, .. } => {
                buffer.align_raw(4)?;
                let at = buffer.offset();
                for limb in &limbs {
                    buffer.append_raw(&limb.to_le_bytes())?;
                }
                locations.limbs.insert(owner, (at, limbs.len() as u32));
            }
        }
    }

    Ok((cold_start, locations))
}
