//! Resumable multi-stage imports: entity tracking with secondary-id
//! resolution and JSON state persistence.
//!
//! An import often has one reliable identifier per inbound row and
//! several more that must be resolved against internal systems. The
//! manager creates an entity on first sight of a primary id, moves each
//! secondary id independently through unresolved → resolved | error,
//! and can save/restore the whole map so a long run survives
//! interruption.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::record::Record;
use crate::core::value::Value;
use crate::cursor::PreparedStatement;
use crate::error::{EtlError, Result};

/// Lifecycle of one secondary identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecondaryId {
    Unresolved,
    Resolved(Value),
    Error(String),
}

impl SecondaryId {
    /// The resolved value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            SecondaryId::Resolved(v) => Some(v),
            _ => None,
        }
    }
}

/// Aggregate entity status, derived from its secondary ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Pending,
    Resolved,
    Error,
    Skipped,
}

/// One tracked entity: a fixed primary id, its secondary ids, and any
/// enrichment fields resolvers returned along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub primary_id: Value,
    pub secondary: BTreeMap<String, SecondaryId>,
    pub status: EntityStatus,
    pub notes: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Resolvers already applied to this entity.
    #[serde(default)]
    applied: BTreeSet<String>,
}

impl Entity {
    fn new(primary_id: Value, secondary_ids: &[String]) -> Self {
        Entity {
            primary_id,
            secondary: secondary_ids
                .iter()
                .map(|sid| (sid.clone(), SecondaryId::Unresolved))
                .collect(),
            status: EntityStatus::Pending,
            notes: Vec::new(),
            fields: BTreeMap::new(),
            applied: BTreeSet::new(),
        }
    }

    /// A resolved secondary id value.
    #[must_use]
    pub fn secondary_value(&self, id: &str) -> Option<&Value> {
        self.secondary.get(id).and_then(SecondaryId::value)
    }

    /// Recompute status: skipped is sticky, any error wins, any
    /// unresolved id keeps the entity pending.
    fn refresh_status(&mut self) {
        if self.status == EntityStatus::Skipped {
            return;
        }
        let mut status = EntityStatus::Resolved;
        for state in self.secondary.values() {
            match state {
                SecondaryId::Error(_) => {
                    status = EntityStatus::Error;
                    break;
                }
                SecondaryId::Unresolved => status = EntityStatus::Pending,
                SecondaryId::Resolved(_) => {}
            }
        }
        self.status = status;
    }

    fn is_fully_resolved(&self) -> bool {
        self.secondary
            .values()
            .all(|s| matches!(s, SecondaryId::Resolved(_)))
    }
}

/// Counts by status, for run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitySummary {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub error: usize,
    pub skipped: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    primary_id: String,
    secondary_ids: Vec<String>,
    entities: BTreeMap<String, Entity>,
}

/// Incremental entity manager for resumable imports.
///
/// Single-threaded; processing the same row twice is a no-op once its
/// ids are resolved. Resolvers are prepared statements keyed by the
/// identifier they resolve *from*; each receives the entity's known ids
/// as its payload and returns a row whose columns fill in secondary ids
/// and enrichment fields.
pub struct EntityManager {
    primary_id: String,
    secondary_ids: Vec<String>,
    entities: BTreeMap<String, Entity>,
    /// secondary id name → value text → primary key text
    secondary_index: HashMap<String, HashMap<String, String>>,
    resolvers: HashMap<String, PreparedStatement>,
}

impl EntityManager {
    /// Create a manager for a primary id and the secondary ids to
    /// resolve.
    #[must_use]
    pub fn new(primary_id: impl Into<String>, secondary_ids: Vec<String>) -> Self {
        let secondary_index = secondary_ids
            .iter()
            .map(|sid| (sid.clone(), HashMap::new()))
            .collect();
        EntityManager {
            primary_id: primary_id.into(),
            secondary_ids,
            entities: BTreeMap::new(),
            secondary_index,
            resolvers: HashMap::new(),
        }
    }

    /// Set the main resolver, keyed from the primary id.
    pub fn set_main_resolver(&mut self, resolver: PreparedStatement) {
        self.resolvers.insert(self.primary_id.clone(), resolver);
    }

    /// Add a fallback resolver keyed from a secondary id.
    ///
    /// # Errors
    ///
    /// The `from_id` must be one of the tracked secondary ids.
    pub fn add_fallback_resolver(
        &mut self,
        from_id: &str,
        resolver: PreparedStatement,
    ) -> Result<()> {
        if !self.secondary_ids.iter().any(|s| s == from_id) {
            return Err(EtlError::Config(format!(
                "fallback resolver from unknown secondary id: {from_id:?}"
            )));
        }
        self.resolvers.insert(from_id.to_string(), resolver);
        Ok(())
    }

    /// Number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when no entities are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Fetch or create the entity for a primary id, seed secondary ids
    /// present in the source row, and run resolvers for any still
    /// unresolved.
    pub async fn process_row(
        &mut self,
        primary_value: Value,
        source_row: &Record,
    ) -> Result<&Entity> {
        if primary_value.is_null() {
            return Err(EtlError::State(
                "cannot process a row with a null primary id".to_string(),
            ));
        }
        let key = primary_value.to_text();
        if !self.entities.contains_key(&key) {
            self.entities.insert(
                key.clone(),
                Entity::new(primary_value, &self.secondary_ids),
            );
        }

        // Seed secondary ids carried by the source row itself.
        for sid in &self.secondary_ids.clone() {
            if let Some(value) = source_row.get(sid) {
                if !value.is_null() {
                    self.adopt_secondary(&key, sid, value.clone())?;
                }
            }
        }

        self.resolve(&key).await?;
        Ok(&self.entities[&key])
    }

    /// Run applicable resolvers for an entity until its ids are
    /// resolved or no resolver can make progress.
    async fn resolve(&mut self, key: &str) -> Result<()> {
        let id_order: Vec<String> = std::iter::once(self.primary_id.clone())
            .chain(self.secondary_ids.iter().cloned())
            .collect();

        for from_id in id_order {
            if self.entities[key].is_fully_resolved() {
                break;
            }
            if self.entities[key].applied.contains(&from_id) {
                continue;
            }
            let Some(from_value) = self.known_value(key, &from_id) else {
                continue;
            };
            if !self.resolvers.contains_key(&from_id) {
                continue;
            }

            let payload = self.resolver_payload(key);
            let resolver = self.resolvers.get_mut(&from_id).unwrap();
            let row = resolver.query_one(&payload).await?;
            debug!(
                primary = key,
                from_id = %from_id,
                from_value = %from_value,
                found = row.is_some(),
                "resolver executed"
            );
            if let Some(row) = row {
                self.absorb(key, &row)?;
                self.entities.get_mut(key).unwrap().applied.insert(from_id);
            }
        }

        self.entities.get_mut(key).unwrap().refresh_status();
        Ok(())
    }

    fn known_value(&self, key: &str, id: &str) -> Option<Value> {
        let entity = &self.entities[key];
        if id == self.primary_id {
            Some(entity.primary_id.clone())
        } else {
            entity.secondary_value(id).cloned()
        }
    }

    /// Payload handed to resolvers: the primary id plus every resolved
    /// secondary id and enrichment field. Extra keys are ignored by the
    /// binder, so one payload serves all resolver queries.
    fn resolver_payload(&self, key: &str) -> HashMap<String, Value> {
        let entity = &self.entities[key];
        let mut payload = HashMap::new();
        payload.insert(self.primary_id.clone(), entity.primary_id.clone());
        for (sid, state) in &entity.secondary {
            if let Some(value) = state.value() {
                payload.insert(sid.clone(), value.clone());
            }
        }
        for (field, value) in &entity.fields {
            payload.insert(field.clone(), value.clone());
        }
        payload
    }

    /// Merge a resolver row into the entity: secondary id columns move
    /// to resolved, everything else becomes an enrichment field.
    fn absorb(&mut self, key: &str, row: &Record) -> Result<()> {
        for sid in &self.secondary_ids.clone() {
            if let Some(value) = row.get(sid) {
                if !value.is_null() {
                    self.adopt_secondary(key, sid, value.clone())?;
                }
            }
        }
        let entity = self.entities.get_mut(key).unwrap();
        for (name, value) in row.keys(false).iter().zip(row.values()) {
            if name != &self.primary_id && !entity.secondary.contains_key(name) {
                entity.fields.insert(name.clone(), value.clone());
            }
        }
        entity.refresh_status();
        Ok(())
    }

    /// Record a secondary id value, checking the reverse index for a
    /// value already claimed by a different entity.
    fn adopt_secondary(&mut self, key: &str, sid: &str, value: Value) -> Result<()> {
        let value_text = value.to_text();
        if let Some(owner) = self.secondary_index[sid].get(&value_text) {
            if owner != key {
                let message = format!(
                    "secondary id conflict: {sid}={value_text} already maps to {owner}"
                );
                let entity = self.entities.get_mut(key).unwrap();
                entity
                    .secondary
                    .insert(sid.to_string(), SecondaryId::Error(message.clone()));
                entity.notes.push(message);
                entity.refresh_status();
                return Ok(());
            }
        }

        let entity = self.entities.get_mut(key).unwrap();
        let previous = entity
            .secondary
            .insert(sid.to_string(), SecondaryId::Resolved(value));
        if let Some(SecondaryId::Resolved(old)) = previous {
            let old_text = old.to_text();
            if old_text != value_text {
                self.secondary_index
                    .get_mut(sid)
                    .unwrap()
                    .remove(&old_text);
            }
        }
        self.secondary_index
            .get_mut(sid)
            .unwrap()
            .insert(value_text, key.to_string());
        self.entities.get_mut(key).unwrap().refresh_status();
        Ok(())
    }

    /// Look up an entity by primary id.
    #[must_use]
    pub fn get(&self, primary_value: &Value) -> Option<&Entity> {
        self.entities.get(&primary_value.to_text())
    }

    /// Look up an entity by one of its resolved secondary ids.
    #[must_use]
    pub fn get_by_secondary(&self, sid: &str, value: &Value) -> Option<&Entity> {
        let key = self.secondary_index.get(sid)?.get(&value.to_text())?;
        self.entities.get(key)
    }

    /// Mark an entity skipped; skipped status survives later rows.
    pub fn mark_skipped(&mut self, primary_value: &Value, note: impl Into<String>) {
        if let Some(entity) = self.entities.get_mut(&primary_value.to_text()) {
            entity.status = EntityStatus::Skipped;
            entity.notes.push(note.into());
        }
    }

    /// Record an error on one secondary id.
    pub fn mark_error(&mut self, primary_value: &Value, sid: &str, message: impl Into<String>) {
        if let Some(entity) = self.entities.get_mut(&primary_value.to_text()) {
            entity
                .secondary
                .insert(sid.to_string(), SecondaryId::Error(message.into()));
            entity.refresh_status();
        }
    }

    /// Iterate over all tracked entities.
    pub fn iter_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Status counts.
    #[must_use]
    pub fn summary(&self) -> EntitySummary {
        let mut summary = EntitySummary {
            total: self.entities.len(),
            ..EntitySummary::default()
        };
        for entity in self.entities.values() {
            match entity.status {
                EntityStatus::Pending => summary.pending += 1,
                EntityStatus::Resolved => summary.resolved += 1,
                EntityStatus::Error => summary.error += 1,
                EntityStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Serialize the full entity map so a run can resume later.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = PersistedState {
            version: 1,
            primary_id: self.primary_id.clone(),
            secondary_ids: self.secondary_ids.clone(),
            entities: self.entities.clone(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(path.as_ref(), json)?;
        info!(
            path = %path.as_ref().display(),
            entities = self.entities.len(),
            "entity state saved"
        );
        Ok(())
    }

    /// Restore a manager from a saved state file.
    ///
    /// Resolvers are not persisted; re-attach them after loading.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let state: PersistedState = serde_json::from_str(&json)?;
        if state.version != 1 {
            return Err(EtlError::State(format!(
                "unsupported entity state version: {}",
                state.version
            )));
        }

        let mut manager = EntityManager::new(state.primary_id, state.secondary_ids);
        for (key, entity) in state.entities {
            for (sid, secondary) in &entity.secondary {
                if let Some(value) = secondary.value() {
                    manager
                        .secondary_index
                        .get_mut(sid)
                        .ok_or_else(|| {
                            EtlError::State(format!("state references unknown id {sid:?}"))
                        })?
                        .insert(value.to_text(), key.clone());
                }
            }
            manager.entities.insert(key, entity);
        }
        info!(
            path = %path.as_ref().display(),
            entities = manager.entities.len(),
            "entity state loaded"
        );
        Ok(manager)
    }
}
