//! Portable heap snapshotting: serialize a reachable object graph to a
//! single file, then later `mmap` it back and patch pointers in place
//! instead of re-running cold-start initialization.
//!
//! The crate is split the way the writer and loader naturally split:
//! [`writer::dump`]/[`writer::measure`] turn a host heap into bytes;
//! [`loader::load`] turns bytes back into a relocated, directly
//! dereferenceable heap. Everything in between — the tagged-value
//! vocabulary ([`value`]), the locality queue ([`queue`]), deferred
//! fixups ([`fixup`]), the on-disk header ([`header`]) — is shared by
//! both halves.
//!
//! `pdump-core` never owns a type registry, a garbage collector, or a
//! native-code loader. Those stay the host's property, consulted through
//! the [`value::TypeOracle`]/[`access::HeapFields`]/[`value::Reflect`]/
//! [`value::NativeLoader`] seams.

pub mod access;
pub mod bitset;
pub mod buffer;
pub mod cold;
pub mod error;
pub mod fixup;
pub mod header;
pub mod hooks;
pub mod loader;
pub mod mmap;
pub mod queue;
pub mod reloc;
pub mod remember;
pub mod value;
pub mod writer;

pub use access::{FinalizerLink, HeapFields, SubrOrigin};
pub use error::{LoadStatus, PdumpError};
pub use header::Fingerprint;
pub use hooks::{HookFn, HookRegistry, RememberedData, RememberedKind, RememberedLocation};
pub use loader::{
    load, loaded, BignumReloader, DumpLoadStats, HostImage, LoadConfig, LoadedDump, NoBignumReloader,
};
pub use value::{
    DumpOff, HostOff, LayoutDescriptor, NativeLoader, NoNativeLoader, ObjectId, PVecKind, Reflect, RootKind,
    SymbolRedirect, Tag, TaggedValue, TypeOracle, Weight,
};
pub use writer::{dump, measure, DumpConfig, DumpOutput, DumpStats};

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::instrument;

/// Write a [`DumpOutput`] to `path` with the same two-phase commit the
/// header format is built around: the magic is flipped to its
/// incomplete form for the first write, and the real (complete) header
/// only replaces it once every other byte has reached disk, so a crash
/// mid-write leaves a file [`load`] will positively reject rather than
/// one it half-trusts.
#[instrument(skip(output), fields(path = %path.as_ref().display(), bytes = output.bytes.len()))]
pub fn write_dump_file(path: impl AsRef<Path>, output: &DumpOutput) -> Result<(), PdumpError> {
    let path = path.as_ref();
    let map_err = |source: std::io::Error| PdumpError::IoFailure {
        path: path.to_path_buf(),
        source,
    };

    let header_len = header::DumpHeader::ENCODED_LEN;
    let (mut final_header, _complete) =
        header::DumpHeader::parse(&output.bytes[..header_len]).map_err(|_| PdumpError::IntegrityViolation {
            what: "writer produced a malformed header".into(),
        })?;
    let final_header_bytes = final_header.encode();
    final_header.mark_incomplete();
    let incomplete_header_bytes = final_header.encode();

    let mut file = std::fs::File::create(path).map_err(map_err)?;
    file.write_all(&incomplete_header_bytes).map_err(map_err)?;
    file.write_all(&output.bytes[header_len..]).map_err(map_err)?;
    file.sync_all().map_err(map_err)?;

    file.seek(SeekFrom::Start(0)).map_err(map_err)?;
    file.write_all(&final_header_bytes).map_err(map_err)?;
    file.sync_all().map_err(map_err)?;
    Ok(())
}
