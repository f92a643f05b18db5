use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::dispatch::{DecodedImage, RequestId};
use crate::error::{ErrorRecord, StoreError};

/// Lifecycle of a logical request. No state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Queued -> InFlight -> {Succeeded, Failed, Cancelled}, or Queued -> Cancelled.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::InFlight)
                | (Self::Queued, Self::Cancelled)
                | (Self::InFlight, Self::Succeeded)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::Cancelled)
        )
    }
}

/// Current state of one request together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Queued,
    InFlight,
    Succeeded(Arc<DecodedImage>),
    Failed(ErrorRecord),
    Cancelled,
}

impl Entry {
    pub fn state(&self) -> RequestState {
        match self {
            Self::Queued => RequestState::Queued,
            Self::InFlight => RequestState::InFlight,
            Self::Succeeded(_) => RequestState::Succeeded,
            Self::Failed(_) => RequestState::Failed,
            Self::Cancelled => RequestState::Cancelled,
        }
    }

    pub fn image(&self) -> Option<&DecodedImage> {
        match self {
            Self::Succeeded(img) => Some(img),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Failed(rec) => Some(rec),
            _ => None,
        }
    }
}

/// Request id -> latest [`Entry`]. One coarse lock; readers never block on network work.
#[derive(Debug, Default)]
pub struct ResultStore {
    entries: RwLock<HashMap<RequestId, Entry>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every id as Queued, or none of them if any id is already known.
    pub fn register_all<'a, I>(&self, ids: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a RequestId>,
        I::IntoIter: Clone,
    {
        let ids = ids.into_iter();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(taken) = ids.clone().find(|id| entries.contains_key(*id)) {
            return Err(StoreError::AlreadyRegistered(taken.clone()));
        }
        for id in ids {
            entries.insert(id.clone(), Entry::Queued);
        }
        Ok(())
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.read().contains_key(id)
    }

    /// Move `id` to `next`, refusing anything that would revisit or overwrite a state.
    pub fn transition(&self, id: &RequestId, next: Entry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let current = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownRequest(id.clone()))?;
        let (from, to) = (current.state(), next.state());
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        *current = next;
        Ok(())
    }

    pub fn get(&self, id: &RequestId) -> Option<Entry> {
        self.read().get(id).cloned()
    }

    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.read().get(id).map(Entry::state)
    }

    /// All entries, sorted by id.
    pub fn snapshot(&self) -> Vec<(RequestId, Entry)> {
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn count(&self, state: RequestState) -> usize {
        self.read().values().filter(|e| e.state() == state).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}
