//! Hook & remembered-data registry.
//!
//! Two independent tables a host registers into ahead of time: post-load
//! callbacks (fired by the loader at the Early/VeryLate hook points, spec
//! §4.8 steps 9 and 11) and "remembered" scalar/pointer locations the
//! writer must preserve across the dump boundary even though they aren't
//! reachable from the ordinary root set (a static buffer the host wants
//! restored byte-for-byte, or a static pointer the host wants re-pointed
//! at a dumped object).

use crate::value::{HostOff, Tag};

pub type HookFn = fn();

/// Static tables of post-load callbacks.
///
/// Registration only ever appends; `pdump-core` never removes a hook once
/// added, mirroring the original's module-level static arrays that are
/// populated once during host startup before any dump/load cycle runs.
#[derive(Default)]
pub struct HookRegistry {
    early: Vec<HookFn>,
    late: Vec<HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs after Early relocations, before the discardable range is
    /// advised away (spec §4.8 step 9).
    pub fn register_hook(&mut self, hook: HookFn) {
        self.early.push(hook);
    }

    /// Runs after Late and VeryLate relocations (spec §4.8 step 11).
    pub fn register_late_hook(&mut self, hook: HookFn) {
        self.late.push(hook);
    }

    pub fn run_early(&self) {
        for hook in &self.early {
            hook();
        }
    }

    pub fn run_late(&self) {
        for hook in &self.late {
            hook();
        }
    }
}

/// What a remembered host location should survive a dump/load cycle as.
#[derive(Debug, Clone, Copy)]
pub enum RememberedKind {
    /// Preserve the raw bytes at this location; no relocation at load,
    /// the location is restored verbatim.
    Scalar { nbytes: usize },
    /// Preserve a reference whose target must itself be dumped and
    /// relocated; `tag` is how the loader should compose the tagged
    /// value once it resolves the target's runtime location.
    TaggedPtr { tag: Tag },
}

/// One user-registered location, keyed by its host offset.
#[derive(Debug, Clone, Copy)]
pub struct RememberedLocation {
    pub host_offset: HostOff,
    pub kind: RememberedKind,
}

/// User-registered scalar/pointer locations to preserve across the dump
/// boundary, outside the ordinary reachable-from-roots graph.
#[derive(Default)]
pub struct RememberedData {
    locations: Vec<RememberedLocation>,
}

impl RememberedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_scalar(&mut self, host_offset: HostOff, nbytes: usize) {
        self.locations.push(RememberedLocation {
            host_offset,
            kind: RememberedKind::Scalar { nbytes },
        });
    }

    pub fn remember_tagged_ptr(&mut self, host_offset: HostOff, tag: Tag) {
        self.locations.push(RememberedLocation {
            host_offset,
            kind: RememberedKind::TaggedPtr { tag },
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &RememberedLocation> {
        self.locations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static EARLY_CALLS: AtomicU32 = AtomicU32::new(0);
    static LATE_CALLS: AtomicU32 = AtomicU32::new(0);

    fn bump_early() {
        EARLY_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn bump_late() {
        LATE_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn hooks_run_in_their_own_phase_only() {
        let mut registry = HookRegistry::new();
        registry.register_hook(bump_early);
        registry.register_late_hook(bump_late);

        let before_early = EARLY_CALLS.load(Ordering::SeqCst);
        let before_late = LATE_CALLS.load(Ordering::SeqCst);
        registry.run_early();
        assert_eq!(EARLY_CALLS.load(Ordering::SeqCst), before_early + 1);
        assert_eq!(LATE_CALLS.load(Ordering::SeqCst), before_late);

        registry.run_late();
        assert_eq!(LATE_CALLS.load(Ordering::SeqCst), before_late + 1);
    }

    #[test]
    fn remembered_data_accumulates_both_kinds() {
        let mut data = RememberedData::new();
        data.remember_scalar(16, 8);
        data.remember_tagged_ptr(32, Tag::Cons);
        assert_eq!(data.iter().count(), 2);
    }
}
