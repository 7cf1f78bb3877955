//! Tracked entities keyed by feed id.
//!
//! The registry owns each entity's lifecycle (first sighting, definition
//! version changes, closure) and the two worklists derived from it: the
//! metadata refresh queue and the archival worklist of closed entities.

use std::{collections::HashMap, path::PathBuf};

use feed_core::{events::EntityStatus, LogLayout};
use tracing::{debug, info};

use crate::refresh::RefreshQueue;

/// Descriptive fields obtained from the metadata lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: Option<String>,
    pub start_time: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackedEntity {
    pub id: String,
    pub log_path: PathBuf,
    pub first_seen: u64,
    pub last_update: u64,
    pub version: u64,
    pub needs_refresh: bool,
    pub status: EntityStatus,
    pub closed_at: Option<u64>,
    pub metadata: Option<EntityMetadata>,
}

/// What changed as a result of one [`Registry::upsert`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new: bool,
    pub version_changed: bool,
    pub just_closed: bool,
}

/// A closed entity whose log is ready to move to the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTask {
    pub entity_id: String,
    pub source: PathBuf,
    pub archive: PathBuf,
}

#[derive(Debug)]
pub struct Registry {
    layout: LogLayout,
    entities: HashMap<String, TrackedEntity>,
    refresh: RefreshQueue,
    /// Closed entities awaiting archival, in closing order.
    closed: Vec<String>,
    track_refresh: bool,
}

impl Registry {
    pub fn new(layout: LogLayout) -> Self {
        Self {
            layout,
            entities: HashMap::new(),
            refresh: RefreshQueue::new(),
            closed: Vec::new(),
            track_refresh: true,
        }
    }

    /// Registry that never queues entities for metadata lookup.
    pub fn without_refresh(layout: LogLayout) -> Self {
        Self {
            track_refresh: false,
            ..Self::new(layout)
        }
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    pub fn get(&self, id: &str) -> Option<&TrackedEntity> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn refresh_queue(&self) -> &RefreshQueue {
        &self.refresh
    }

    pub fn refresh_queue_mut(&mut self) -> &mut RefreshQueue {
        &mut self.refresh
    }

    /// Ids closed but not yet archived.
    pub fn pending_archive(&self) -> &[String] {
        &self.closed
    }

    /// Record an update for `id` seen at `now`.
    ///
    /// Status is applied before version, so an update that closes an entity
    /// and bumps its version in the same message does not queue a refresh.
    pub fn upsert(
        &mut self,
        id: &str,
        version: Option<u64>,
        status: Option<EntityStatus>,
        now: u64,
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();

        if !self.entities.contains_key(id) {
            debug!(entity = id, "tracking new entity");
            self.entities.insert(
                id.to_string(),
                TrackedEntity {
                    id: id.to_string(),
                    log_path: self.layout.log_path(id),
                    first_seen: now,
                    last_update: now,
                    version: version.unwrap_or(0),
                    needs_refresh: self.track_refresh,
                    status: EntityStatus::Open,
                    closed_at: None,
                    metadata: None,
                },
            );
            if self.track_refresh {
                self.refresh.push(id);
            }
            outcome.is_new = true;
        }

        let Some(entity) = self.entities.get_mut(id) else {
            return outcome;
        };
        entity.last_update = now;

        if let Some(status) = status {
            if entity.status != EntityStatus::Closed {
                if status == EntityStatus::Closed {
                    info!(entity = id, "entity closed");
                    entity.status = EntityStatus::Closed;
                    entity.closed_at = Some(now);
                    self.closed.push(id.to_string());
                    outcome.just_closed = true;
                } else {
                    entity.status = status;
                }
            }
        }

        if let Some(version) = version {
            if entity.version != version && entity.status != EntityStatus::Closed {
                debug!(entity = id, from = entity.version, to = version, "definition version changed");
                entity.version = version;
                if self.track_refresh {
                    entity.needs_refresh = true;
                    self.refresh.push(id);
                }
                outcome.version_changed = true;
            }
        }

        outcome
    }

    /// Store looked-up metadata. Returns the entity's log path, or `None`
    /// when the entity is no longer tracked.
    pub fn apply_metadata(
        &mut self,
        id: &str,
        metadata: EntityMetadata,
        now: u64,
    ) -> Option<PathBuf> {
        let entity = self.entities.get_mut(id)?;
        entity.metadata = Some(metadata);
        entity.needs_refresh = false;
        entity.last_update = now;
        self.refresh.remove(id);
        Some(entity.log_path.clone())
    }

    /// Remove every closed entity whose grace period has elapsed at `now`
    /// and return the archive moves for them.
    pub fn drain_archivable(&mut self, now: u64, grace_ms: u64) -> Vec<ArchiveTask> {
        let mut tasks = Vec::new();
        let mut waiting = Vec::with_capacity(self.closed.len());
        for id in self.closed.drain(..) {
            let ready = match self.entities.get(&id).and_then(|e| e.closed_at) {
                Some(closed_at) => closed_at.saturating_add(grace_ms) <= now,
                None => false,
            };
            if !ready {
                if self.entities.contains_key(&id) {
                    waiting.push(id);
                }
                continue;
            }
            if let Some(entity) = self.entities.remove(&id) {
                self.refresh.remove(&id);
                tasks.push(ArchiveTask {
                    archive: self.layout.archive_path(&id),
                    source: entity.log_path,
                    entity_id: id,
                });
            }
        }
        self.closed = waiting;
        tasks
    }

    /// Drop open entities with no update for `idle_ms` at `now`. Closed
    /// entities are left to [`Registry::drain_archivable`]. Returns the
    /// number removed.
    pub fn retire_idle(&mut self, now: u64, idle_ms: u64) -> usize {
        let before = self.entities.len();
        let refresh = &mut self.refresh;
        self.entities.retain(|id, e| {
            let keep = e.status == EntityStatus::Closed
                || e.last_update.saturating_add(idle_ms) > now;
            if !keep {
                refresh.remove(id);
            }
            keep
        });
        let retired = before - self.entities.len();
        if retired > 0 {
            debug!(retired, remaining = self.entities.len(), "retired idle entities");
        }
        retired
    }
}
