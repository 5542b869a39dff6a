//! Dataset claims held by a job.
//!
//! A job holds one [`LockedDatasetSet`] per [`LockFlag`]. The set only
//! tracks the ids claimed since the last save plus a pending release; the
//! claims themselves live in the `locked_datasets` table where
//! `(dataset_id, flag)` is unique.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::persistence_state::PersistenceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockFlag {
    /// Inputs of a consolidation, held until orders are prepared.
    Init,
    /// Datasets scheduled for removal.
    ToDelete,
    /// Datasets produced by a consolidation, not yet swapped in.
    New,
}

impl LockFlag {
    pub const ALL: [LockFlag; 3] = [LockFlag::Init, LockFlag::ToDelete, LockFlag::New];

    pub fn index(self) -> usize {
        match self {
            Self::Init => 0,
            Self::ToDelete => 1,
            Self::New => 2,
        }
    }

    pub fn from_index(index: i16) -> Option<Self> {
        match index {
            0 => Some(Self::Init),
            1 => Some(Self::ToDelete),
            2 => Some(Self::New),
            _ => None,
        }
    }

    /// Value stored in the `flag` column.
    pub fn as_db(self) -> i16 {
        self.index() as i16
    }
}

impl fmt::Display for LockFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::ToDelete => write!(f, "to_delete"),
            Self::New => write!(f, "new"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockedDatasetSet {
    flag: LockFlag,
    new_ids: BTreeSet<Uuid>,
    release_requested: bool,
    persistence: PersistenceState,
}

impl LockedDatasetSet {
    pub fn new(flag: LockFlag) -> Self {
        Self {
            flag,
            new_ids: BTreeSet::new(),
            release_requested: false,
            persistence: PersistenceState::Clean,
        }
    }

    pub fn flag(&self) -> LockFlag {
        self.flag
    }

    pub fn new_ids(&self) -> &BTreeSet<Uuid> {
        &self.new_ids
    }

    pub fn release_requested(&self) -> bool {
        self.release_requested
    }

    pub fn persistence(&self) -> PersistenceState {
        self.persistence
    }

    pub fn lock(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        let before = self.new_ids.len();
        self.new_ids.extend(ids);
        if self.new_ids.len() != before {
            self.persistence.mark_dirty();
        }
    }

    /// Releases every claim under this flag, including ones not saved yet.
    pub fn release(&mut self) {
        self.new_ids.clear();
        self.release_requested = true;
        self.persistence.mark_dirty();
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.new_ids.clear();
        self.release_requested = false;
        self.persistence.mark_persisted();
    }
}
