//! Lifecycle tag telling the persister what to do with an entity on save.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persistence lifecycle of a mutable entity.
///
/// Allowed moves: `New`/`Clean` → `Dirty` (a `New` entity stays `New`),
/// any active state → `ToDelete`, and on save `New`/`Dirty` → `Clean`,
/// `ToDelete` → `Deleted`. Touching a `Deleted` entity is a programming error
/// and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PersistenceState {
    #[default]
    Unknown,
    New,
    Clean,
    Dirty,
    ToDelete,
    Deleted,
}

impl PersistenceState {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty)
    }

    pub fn is_to_delete(&self) -> bool {
        matches!(self, Self::ToDelete)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// New, Clean or Dirty: the entity exists (or will exist) after the next save.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::Clean | Self::Dirty)
    }

    /// Whether the next save has anything to write for this entity.
    pub fn needs_save(&self) -> bool {
        matches!(self, Self::New | Self::Dirty | Self::ToDelete)
    }

    /// Records a modification.
    ///
    /// # Panics
    /// If the entity has already been deleted.
    pub fn mark_dirty(&mut self) {
        self.assert_alive("modify");
        if matches!(self, Self::Clean | Self::Unknown) {
            *self = Self::Dirty;
        }
    }

    /// Schedules the entity for deletion on the next save.
    ///
    /// # Panics
    /// If the entity has already been deleted.
    pub fn mark_to_delete(&mut self) {
        self.assert_alive("delete");
        *self = Self::ToDelete;
    }

    /// Advances the state once the persister wrote the entity.
    ///
    /// # Panics
    /// If the entity has already been deleted.
    pub fn mark_persisted(&mut self) {
        self.assert_alive("persist");
        *self = match self {
            Self::ToDelete => Self::Deleted,
            _ => Self::Clean,
        };
    }

    fn assert_alive(&self, operation: &str) {
        assert!(
            !self.is_deleted(),
            "cannot {operation} an entity that has already been deleted"
        );
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::New => "new",
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::ToDelete => "to_delete",
            Self::Deleted => "deleted",
        };
        f.write_str(label)
    }
}
