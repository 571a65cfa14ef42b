//! Recreation-safe UI surfaces.
//!
//! A surface is a UI-visible indicator (progress or conflict) registered in
//! a [`SurfaceRegistry`] under a stable logical identity. The registry is
//! the live-resource directory that outlives any one `TaskClient`: after UI
//! recreation a fresh client looks a surface up by identity and reuses it
//! instead of creating a duplicate. Surfaces are shared single-threaded
//! cells (`Rc<RefCell<_>>`); the embedding UI renders from the same cells
//! the client mutates.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::model::{ConflictSnapshot, TextRef};

/// Stable logical tag identifying one surface slot across UI recreation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub &'static str);

impl SurfaceId {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

/// Identity of the progress surface.
pub const PROGRESS_SURFACE: SurfaceId = SurfaceId("progress-task");
/// Identity of the store-changed conflict surface.
pub const STORE_CHANGED_SURFACE: SurfaceId = SurfaceId("store-changed");

/// What the progress surface currently shows. Partial updates merge; unset
/// fields retain their prior value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub title: Option<TextRef>,
    pub message: Option<TextRef>,
    pub warning: Option<TextRef>,
}

/// The singleton progress indicator for the active command.
#[derive(Debug)]
pub struct ProgressSurface {
    instance: u64,
    state: ProgressState,
}

impl ProgressSurface {
    fn new(instance: u64) -> Self {
        Self {
            instance,
            state: ProgressState::default(),
        }
    }

    /// Merge the supplied fields into the shown state.
    pub fn apply(
        &mut self,
        title: Option<TextRef>,
        message: Option<TextRef>,
        warning: Option<TextRef>,
    ) {
        if let Some(title) = title {
            self.state.title = Some(title);
        }
        if let Some(message) = message {
            self.state.message = Some(message);
        }
        if let Some(warning) = warning {
            self.state.warning = Some(warning);
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Creation ordinal, stable for the surface's lifetime. A recovered
    /// surface keeps its ordinal, so UI layers can tell reuse from
    /// recreation.
    pub fn instance(&self) -> u64 {
        self.instance
    }
}

/// The singleton conflict prompt for an externally changed store.
///
/// Holds exactly one pending snapshot; presenting a new one replaces it
/// (last-snapshot-wins) and re-arms the decision. At most one decision is
/// ever accepted per presented snapshot.
#[derive(Debug)]
pub struct ConflictSurface {
    instance: u64,
    snapshot: ConflictSnapshot,
    decided: bool,
}

impl ConflictSurface {
    fn new(instance: u64, snapshot: ConflictSnapshot) -> Self {
        Self {
            instance,
            snapshot,
            decided: false,
        }
    }

    /// Replace the pending snapshot and re-arm the decision.
    pub fn replace(&mut self, snapshot: ConflictSnapshot) {
        self.snapshot = snapshot;
        self.decided = false;
    }

    /// Record the user's decision. Returns `true` the first time only;
    /// later calls for the same snapshot are ignored.
    pub fn resolve(&mut self) -> bool {
        if self.decided {
            return false;
        }
        self.decided = true;
        true
    }

    pub fn snapshot(&self) -> &ConflictSnapshot {
        &self.snapshot
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }
}

enum SurfaceEntry {
    Progress(Rc<RefCell<ProgressSurface>>),
    Conflict(Rc<RefCell<ConflictSurface>>),
}

/// Directory of live surfaces, keyed by logical identity.
///
/// The registry owns visibility: a surface is visible exactly while its
/// identity is present here. Creation is idempotent and removal tolerates
/// "already gone".
#[derive(Default)]
pub struct SurfaceRegistry {
    entries: HashMap<SurfaceId, SurfaceEntry>,
    created: HashMap<SurfaceId, u64>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live progress surface.
    pub fn find_progress(&self) -> Option<Rc<RefCell<ProgressSurface>>> {
        match self.entries.get(&PROGRESS_SURFACE) {
            Some(SurfaceEntry::Progress(surface)) => Some(surface.clone()),
            _ => None,
        }
    }

    /// Find-or-create the progress surface. Calling this twice in a row
    /// never produces two surfaces.
    pub fn create_progress(&mut self) -> Rc<RefCell<ProgressSurface>> {
        if let Some(existing) = self.find_progress() {
            return existing;
        }
        let instance = self.next_instance(PROGRESS_SURFACE);
        let surface = Rc::new(RefCell::new(ProgressSurface::new(instance)));
        self.entries
            .insert(PROGRESS_SURFACE, SurfaceEntry::Progress(surface.clone()));
        surface
    }

    /// Look up a live conflict surface.
    pub fn find_conflict(&self) -> Option<Rc<RefCell<ConflictSurface>>> {
        match self.entries.get(&STORE_CHANGED_SURFACE) {
            Some(SurfaceEntry::Conflict(surface)) => Some(surface.clone()),
            _ => None,
        }
    }

    /// Find-or-create the conflict surface for a snapshot. An existing
    /// surface adopts the new snapshot (last-snapshot-wins).
    pub fn create_conflict(&mut self, snapshot: ConflictSnapshot) -> Rc<RefCell<ConflictSurface>> {
        if let Some(existing) = self.find_conflict() {
            existing.borrow_mut().replace(snapshot);
            return existing;
        }
        let instance = self.next_instance(STORE_CHANGED_SURFACE);
        let surface = Rc::new(RefCell::new(ConflictSurface::new(instance, snapshot)));
        self.entries.insert(
            STORE_CHANGED_SURFACE,
            SurfaceEntry::Conflict(surface.clone()),
        );
        surface
    }

    /// Hide and release a surface. Removing an identity that is not present
    /// is success, not failure (state-loss-tolerant dismissal).
    pub fn remove(&mut self, id: SurfaceId) {
        if self.entries.remove(&id).is_none() {
            tracing::debug!(surface = id.as_str(), "surface already dismissed");
        }
    }

    pub fn is_visible(&self, id: SurfaceId) -> bool {
        self.entries.contains_key(&id)
    }

    /// How many surfaces have ever been created under this identity.
    /// Recovery-by-identity keeps this at one across UI recreation.
    pub fn created_count(&self, id: SurfaceId) -> u64 {
        self.created.get(&id).copied().unwrap_or(0)
    }

    fn next_instance(&mut self, id: SurfaceId) -> u64 {
        let counter = self.created.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }
}
