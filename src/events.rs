//! Warning sink for non-fatal diagnostics.
//!
//! Heritage and merging degrade gracefully in several situations: a guard range that could
//! not be tightened, a symbol whose storage could not be unified, a space linked again after
//! dead-code removal. None of these abort the function; they are recorded here, keyed by the
//! address they concern, and surfaced to the driver.
//!
//! # Architecture
//!
//! - [`EventKind`] - What happened
//! - [`Event`] - One recorded diagnostic with its address
//! - [`WarningSink`] - Append-only, deduplicated collection of events
//!
//! Recording takes `&self`, so the sink can be shared by the heritage driver and the merge
//! engine without threading a mutable borrow through both.
//!
//! # Example
//!
//! ```rust,ignore
//! use heritage::events::{EventKind, WarningSink};
//!
//! let sink = WarningSink::new();
//! sink.warn(EventKind::GuardUnresolved, addr, "Unable to bound indexed store");
//! sink.warn(EventKind::GuardUnresolved, addr, "Unable to bound indexed store");
//! assert_eq!(sink.len(), 1);
//! ```

use std::fmt;

use crate::ir::Address;

/// Classification of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A range was linked again after dead-code removal had run on its space.
    HeritageAfterDeadRemoval,
    /// Guard analysis left a pointer range over-approximated.
    GuardUnresolved,
    /// The storage locations of a multi-entry symbol could not all be merged.
    MultiEntryConflict,
    /// A required merge needed a COPY to separate overlapping live ranges.
    ForcedSplit,
    /// Informational note.
    Info,
}

impl EventKind {
    /// Returns a short human-readable description of this kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::HeritageAfterDeadRemoval => "heritage after dead removal",
            Self::GuardUnresolved => "guard unresolved",
            Self::MultiEntryConflict => "multi-entry conflict",
            Self::ForcedSplit => "forced split",
            Self::Info => "info",
        }
    }

    /// Returns true for kinds that indicate reduced output quality.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::Info)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A single recorded diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Address the diagnostic is attached to.
    pub addr: Address,
    /// Free-form detail.
    pub message: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.addr, self.message)
    }
}

/// Append-only, deduplicated store of diagnostics for one function.
#[derive(Debug)]
pub struct WarningSink {
    events: boxcar::Vec<Event>,
}

impl Default for WarningSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WarningSink {
    fn clone(&self) -> Self {
        let new_sink = Self::new();
        for (_, event) in &self.events {
            new_sink.events.push(event.clone());
        }
        new_sink
    }
}

impl WarningSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }

    /// Records a diagnostic unless an identical one (same address and message) exists.
    ///
    /// Returns true if the event was new. Warnings are mirrored to the `log` facade.
    pub fn warn(&self, kind: EventKind, addr: Address, message: impl Into<String>) -> bool {
        let message = message.into();
        if self
            .events
            .iter()
            .any(|(_, e)| e.addr == addr && e.message == message)
        {
            return false;
        }
        if kind.is_warning() {
            log::warn!("{addr}: {message}");
        } else {
            log::info!("{addr}: {message}");
        }
        self.events.push(Event {
            kind,
            addr,
            message,
        });
        true
    }

    /// Records an informational note.
    pub fn info(&self, addr: Address, message: impl Into<String>) -> bool {
        self.warn(EventKind::Info, addr, message)
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// True if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// True if at least one event of `kind` was recorded.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.events.iter().any(|(_, e)| e.kind == kind)
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|(_, e)| e.kind == kind).count()
    }

    /// Iterates over every event in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Iterates over events that indicate reduced output quality.
    pub fn warnings(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events
            .iter()
            .filter_map(|(_, e)| if e.kind.is_warning() { Some(e) } else { None })
    }

    /// Iterates over events attached to `addr`.
    pub fn at(&self, addr: Address) -> impl Iterator<Item = &Event> + '_ {
        self.events
            .iter()
            .filter_map(move |(_, e)| if e.addr == addr { Some(e) } else { None })
    }
}
