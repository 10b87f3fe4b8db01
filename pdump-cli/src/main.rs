//! Drive `pdump-core`'s writer and loader over a small toy interpreter
//! heap: `pdump-cli dump <file>` serializes the demo heap to disk,
//! `pdump-cli load <file>` maps a previously written dump back in and
//! reports what the loader found.

mod heap;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use pdump_core::header::Fingerprint;
use pdump_core::hooks::HookRegistry;
use pdump_core::loader::{self, HostImage, LoadConfig, NoBignumReloader};
use pdump_core::value::{HostOff, NoNativeLoader, Tag, TypeOracle};
use pdump_core::writer::{self, DumpConfig};
use pdump_core::{write_dump_file, RememberedData};

use heap::demo_heap;

#[derive(Parser)]
#[command(name = "pdump-cli", about = "Dump and load a toy interpreter heap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serialize the built-in demo heap to `file`.
    Dump {
        file: PathBuf,
        /// Pack objects at 1-byte alignment instead of 8.
        #[arg(long)]
        pack_objects: bool,
        /// Record a referrer path for every reachable object, for
        /// richer `UnsupportedObject` diagnostics.
        #[arg(long)]
        track_referrers: bool,
    },
    /// Load a previously written dump and report what came back.
    Load { file: PathBuf },
    /// Print the byte size `dump` would produce without writing anything.
    Measure {
        #[arg(long)]
        pack_objects: bool,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Dump {
            file,
            pack_objects,
            track_referrers,
        } => run_dump(&file, pack_objects, track_referrers),
        Command::Load { file } => run_load(&file),
        Command::Measure { pack_objects } => run_measure(pack_objects),
    };

    if let Err(message) = result {
        eprintln!("pdump-cli: {message}");
        std::process::exit(1);
    }
}

fn demo_fingerprint(heap: &heap::Heap) -> Fingerprint {
    Fingerprint::compute(&heap.layout_descriptor(), env!("CARGO_PKG_VERSION"))
}

fn run_dump(path: &PathBuf, pack_objects: bool, track_referrers: bool) -> Result<(), String> {
    let heap = demo_heap();
    let config = DumpConfig {
        track_referrers,
        pack_objects,
    };
    let fingerprint = demo_fingerprint(&heap);
    let remembered = RememberedData::new();

    let output = writer::dump(&heap, &heap, &remembered, config, fingerprint).map_err(|e| e.to_string())?;
    info!(
        bytes = output.bytes.len(),
        object_starts = output.stats.nr_object_starts,
        dump_relocs = output.stats.nr_dump_relocs,
        emacs_relocs = output.stats.nr_emacs_relocs,
        hash_tables = output.stats.nr_hash_tables,
        "dumped heap"
    );

    write_dump_file(path, &output).map_err(|e| e.to_string())?;
    println!("wrote {} bytes to {}", output.bytes.len(), path.display());
    Ok(())
}

fn run_measure(pack_objects: bool) -> Result<(), String> {
    let heap = demo_heap();
    let config = DumpConfig {
        track_referrers: false,
        pack_objects,
    };
    let estimate = writer::measure(&heap, &heap, config).map_err(|e| e.to_string())?;
    println!("estimated object-section size: {estimate} bytes");
    Ok(())
}

/// A [`HostImage`] standing in for the interpreter's data segment. The
/// demo heap has no host-resident objects, so every relocation that
/// would touch it (`DumpToHostPtr`, `CopyFromDump`, ...) simply never
/// fires; this only exists to satisfy the loader's trait boundary.
struct NullHost;

impl HostImage for NullHost {
    fn host_basis(&self) -> i64 {
        0
    }

    fn write_at(&mut self, _offset: HostOff, _bytes: &[u8]) {}

    fn compose_tagged(&self, absolute_addr: i64, tag: Tag) -> u64 {
        (absolute_addr as u64) | ((tag as u64) << 56)
    }
}

fn run_load(path: &PathBuf) -> Result<(), String> {
    let heap = demo_heap();
    let fingerprint = demo_fingerprint(&heap);

    let config = LoadConfig {
        path: path.clone(),
        argv0: std::env::args_os().next().map(PathBuf::from),
    };
    let mut host = NullHost;
    let mut bignums = NoBignumReloader;
    let hooks = HookRegistry::new();

    loader::load(
        &config,
        |fp| fp == fingerprint,
        &mut host,
        &NoNativeLoader,
        &mut bignums,
        &hooks,
    )
    .map_err(|status| status.to_string())?;

    let handle = loader::loaded().expect("load() just installed the process-wide dump");
    let loaded = handle.lock().expect("process dump mutex poisoned");
    let stats = loaded.stats();
    println!(
        "loaded {} in {:.6}s ({} bytes)",
        stats.dump_file_path.display(),
        stats.load_time_seconds,
        loaded.dump_bytes().len(),
    );
    Ok(())
}
