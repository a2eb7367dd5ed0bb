use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::source::{Artifact, PreviewError};

/// Logical column identity, stable under view sorting and filtering.
/// Previews exist for the primary data column and for data annotation
/// columns; text annotations render as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnKey {
    Primary,
    DataAnnotation(String),
    TextAnnotation(String),
}

impl ColumnKey {
    pub fn bears_preview(&self) -> bool {
        matches!(self, ColumnKey::Primary | ColumnKey::DataAnnotation(_))
    }

    pub fn title(&self) -> &str {
        match self {
            ColumnKey::Primary => "Data",
            ColumnKey::DataAnnotation(name) | ColumnKey::TextAnnotation(name) => name,
        }
    }
}

/// Identity of one preview cell: model row index plus logical column.
/// View rows are never stored here; they shift whenever the user re-sorts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub row: usize,
    pub column: ColumnKey,
}

impl CellKey {
    pub fn primary(row: usize) -> Self {
        Self { row, column: ColumnKey::Primary }
    }

    pub fn data_annotation(row: usize, name: &str) -> Self {
        Self { row, column: ColumnKey::DataAnnotation(name.to_string()) }
    }
}

/// Per-cell state. `Ready` and `Failed` keep the epoch they were computed
/// under; a slot from an older epoch reads as `Empty` (lazy eviction).
#[derive(Debug, Clone)]
pub enum CacheSlot {
    Empty,
    Pending { epoch: u64 },
    Ready { artifact: Arc<Artifact>, epoch: u64 },
    Failed { error: String, epoch: u64 },
}

impl CacheSlot {
    fn epoch(&self) -> Option<u64> {
        match self {
            CacheSlot::Empty => None,
            CacheSlot::Pending { epoch }
            | CacheSlot::Ready { epoch, .. }
            | CacheSlot::Failed { epoch, .. } => Some(*epoch),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CacheSlot::Pending { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CacheSlot::Ready { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub ready: usize,
    pub pending: usize,
    pub failed: usize,
    pub stale: usize,
}

struct CacheState {
    slots: HashMap<CellKey, CacheSlot>,
    epoch: u64,
}

/// Mapping from cell keys to preview slots, plus the single global
/// invalidation epoch. One mutex guards both so the epoch check and the slot
/// transition are atomic; cells are otherwise independent.
pub struct PreviewCache {
    state: Mutex<CacheState>,
}

impl Default for PreviewCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState { slots: HashMap::new(), epoch: 0 }),
        }
    }

    // A poisoned lock still holds consistent state: transitions never panic
    // mid-update, so take the inner value instead of propagating.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Effective slot state for a key. Pure read: never dispatches work and
    /// never mutates the mapping. Slots from an older epoch read as `Empty`.
    pub fn get(&self, key: &CellKey) -> CacheSlot {
        let st = self.lock();
        match st.slots.get(key) {
            Some(slot) if slot.epoch() == Some(st.epoch) => slot.clone(),
            _ => CacheSlot::Empty,
        }
    }

    /// Claim a key for rendering. Returns the epoch to attach to the work
    /// unit when the caller must dispatch one, `None` when the slot is
    /// already pending, ready or failed for the current epoch. Stale slots
    /// of any kind are re-claimed.
    pub fn request(&self, key: &CellKey) -> Option<u64> {
        let mut st = self.lock();
        let epoch = st.epoch;
        let current = st
            .slots
            .get(key)
            .is_some_and(|slot| slot.epoch() == Some(epoch));
        if current {
            return None;
        }
        st.slots.insert(key.clone(), CacheSlot::Pending { epoch });
        Some(epoch)
    }

    /// Apply a finished render. Returns `true` when the slot transitioned to
    /// `Ready`/`Failed`. A result carrying an old epoch is discarded and the
    /// superseded `Pending` entry is dropped, so the next visibility pass
    /// re-requests the cell; a slow stale render can never clobber a newer
    /// slot.
    pub fn complete(
        &self,
        key: &CellKey,
        epoch: u64,
        result: Result<Artifact, PreviewError>,
    ) -> bool {
        let mut st = self.lock();
        let pending_at_epoch = matches!(
            st.slots.get(key),
            Some(CacheSlot::Pending { epoch: e }) if *e == epoch
        );
        if st.epoch != epoch {
            if pending_at_epoch {
                st.slots.remove(key);
            }
            return false;
        }
        if !pending_at_epoch {
            return false;
        }
        let slot = match result {
            Ok(artifact) => CacheSlot::Ready { artifact: Arc::new(artifact), epoch },
            Err(err) => CacheSlot::Failed { error: err.to_string(), epoch },
        };
        st.slots.insert(key.clone(), slot);
        true
    }

    /// Invalidate every slot by bumping the epoch. O(1): existing slots are
    /// left in place and filtered out lazily on the next access.
    pub fn invalidate_all(&self) -> u64 {
        let mut st = self.lock();
        st.epoch += 1;
        st.epoch
    }

    pub fn slot_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        let mut stats = CacheStats::default();
        for slot in st.slots.values() {
            if slot.epoch() != Some(st.epoch) {
                stats.stale += 1;
                continue;
            }
            match slot {
                CacheSlot::Pending { .. } => stats.pending += 1,
                CacheSlot::Ready { .. } => stats.ready += 1,
                CacheSlot::Failed { .. } => stats.failed += 1,
                CacheSlot::Empty => {}
            }
        }
        stats
    }
}
