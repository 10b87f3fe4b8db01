//! Object-to-offset memoization and referrer tracking.
//!
//! Every object the writer touches is looked up here first: either it has
//! already been dumped (a positive offset), it is sitting on one of the
//! deferred queues (a negative sentinel), or it has never been seen. The
//! referrer map is optional bookkeeping, enabled only when a caller wants
//! root-to-object paths in `UnsupportedObject` diagnostics — it costs a
//! hash-map insert per edge, so it stays off by default.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::value::{DumpOff, ObjectId};

/// Where an object currently stands relative to the dump.
///
/// All the "not yet at a final offset" cases collapse to one of these
/// sentinels rather than a magic negative number, unlike a packed
/// `dump_off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberedOffset {
    NotSeen,
    OnNormalQueue,
    OnColdQueue,
    OnSymbolQueue,
    OnHashTableQueue,
    OnCopiedQueue,
    /// The object lives in the host's data segment and is never assigned
    /// a dump offset at all; fixups targeting it resolve straight to a
    /// host relocation instead of waiting on `At`.
    RuntimeMagic,
    /// Final, physical offset into the dump.
    At(DumpOff),
}

impl RememberedOffset {
    pub fn as_final(self) -> Option<DumpOff> {
        match self {
            RememberedOffset::At(off) => Some(off),
            _ => None,
        }
    }
}

/// Tracks where every object the writer has seen currently stands, and
/// (optionally) who referred it there.
pub struct RememberTable {
    offsets: HashMap<ObjectId, RememberedOffset>,
    referrers: Option<HashMap<ObjectId, Vec<String>>>,
    current_referrer: Option<String>,
}

impl RememberTable {
    pub fn new(track_referrers: bool) -> Self {
        RememberTable {
            offsets: HashMap::new(),
            referrers: track_referrers.then(HashMap::new),
            current_referrer: None,
        }
    }

    pub fn tracking_referrers(&self) -> bool {
        self.referrers.is_some()
    }

    pub fn recall(&self, object: ObjectId) -> RememberedOffset {
        self.offsets.get(&object).copied().unwrap_or(RememberedOffset::NotSeen)
    }

    pub fn remember(&mut self, object: ObjectId, at: RememberedOffset) {
        self.offsets.insert(object, at);
    }

    /// Set the referrer in effect for the duration of one object-walking
    /// call. Panics on reentrant use — the writer never enqueues an
    /// object without first naming who referred it.
    pub fn set_referrer(&mut self, label: impl Into<String>) {
        assert!(self.current_referrer.is_none(), "reentrant set_referrer");
        self.current_referrer = Some(label.into());
    }

    pub fn clear_referrer(&mut self) {
        assert!(self.current_referrer.is_some(), "clear_referrer without set_referrer");
        self.current_referrer = None;
    }

    /// Record that `object` was reached through the referrer currently in
    /// effect. No-op when referrer tracking is disabled.
    pub fn note_reachable(&mut self, object: ObjectId) {
        let Some(referrers) = self.referrers.as_mut() else {
            return;
        };
        let referrer = self
            .current_referrer
            .clone()
            .expect("note_reachable called without an active referrer");
        let list = referrers.entry(object).or_default();
        if !list.contains(&referrer) {
            list.push(referrer);
        }
    }

    /// Render every path from a root down to `object`, one line per hop,
    /// indented by depth — used to annotate `UnsupportedObject` errors.
    pub fn paths_to_root(&self, object: ObjectId) -> Option<String> {
        let referrers = self.referrers.as_ref()?;
        let mut out = String::new();
        self.paths_to_root_1(referrers, object, 0, &mut out);
        (!out.is_empty()).then_some(out)
    }

    fn paths_to_root_1(&self, referrers: &HashMap<ObjectId, Vec<String>>, object: ObjectId, depth: usize, out: &mut String) {
        let Some(parents) = referrers.get(&object) else {
            return;
        };
        for parent in parents {
            let _ = writeln!(out, "{}{}", " ".repeat(depth), parent);
        }
    }
}
