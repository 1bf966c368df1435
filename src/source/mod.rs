//! External data-source capability.
//!
//! Each configured `(entity, source)` pair maps to a driver implementing
//! [`DataSource`]. The reconciliation worker is the sole caller and always
//! goes through [`SourceRegistry`], which wraps every call in a timeout and
//! converts raw driver failures into [`SourceError`]. A call that outlives
//! its timeout is abandoned to finish on its own thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::error::Transience;
use crate::model::{Document, EntityName, ForeignKey, SourceName};

pub mod memory;

pub use memory::MemorySource;

/// Raw driver failure; the registry boundary attaches entity/source names.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SourceFault(pub String);

#[derive(Debug, Error)]
#[error("source {entity}/{source}: {kind}")]
pub struct SourceError {
    pub entity: EntityName,
    pub source: SourceName,
    pub kind: SourceErrorKind,
}

#[derive(Debug, Error)]
pub enum SourceErrorKind {
    #[error("no data source registered")]
    Unregistered,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(#[from] SourceFault),
}

impl SourceError {
    pub fn transience(&self) -> Transience {
        match self.kind {
            SourceErrorKind::Unregistered => Transience::Permanent,
            SourceErrorKind::Timeout(_) | SourceErrorKind::Failed(_) => Transience::Retryable,
        }
    }
}

/// One external system holding a copy of an entity.
///
/// Drivers traffic in the opaque foreign id only; the registry attaches the
/// `(entity, source)` identity. `get` returning `None` means the source has
/// no document for the id. `set` with no id asks the source to allocate one.
pub trait DataSource: Send + Sync {
    fn get(&self, foreign_id: &str) -> Result<Option<Document>, SourceFault>;
    fn set(&self, foreign_id: Option<&str>, doc: &Document) -> Result<String, SourceFault>;
    fn delete(&self, foreign_id: &str) -> Result<(), SourceFault>;
}

/// Runtime mapping from `(entity, source)` to a driver, plus the per-call
/// timeout boundary.
pub struct SourceRegistry {
    timeout: Duration,
    entities: BTreeMap<EntityName, Vec<SourceName>>,
    sources: BTreeMap<(EntityName, SourceName), Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entities: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }

    /// Build drivers for every configured source.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut registry = Self::new(config.source_timeout());
        for entity in &config.entities {
            let entity_name = EntityName::new(&entity.name)
                .map_err(|e| ConfigError::Invalid(format!("entity name: {e}")))?;
            for source in &entity.sources {
                let source_name = SourceName::new(&source.name)
                    .map_err(|e| ConfigError::Invalid(format!("source name: {e}")))?;
                let driver: Arc<dyn DataSource> = match source.driver.as_str() {
                    "memory" => Arc::new(MemorySource::from_settings(&source.settings)),
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "unknown driver {other:?} for {}/{}",
                            entity.name, source.name
                        )));
                    }
                };
                registry.register(entity_name.clone(), source_name, driver);
            }
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        entity: EntityName,
        source: SourceName,
        driver: Arc<dyn DataSource>,
    ) {
        self.entities
            .entry(entity.clone())
            .or_default()
            .push(source.clone());
        self.sources.insert((entity, source), driver);
    }

    pub fn is_registered(&self, entity: &EntityName, source: &SourceName) -> bool {
        self.sources
            .contains_key(&(entity.clone(), source.clone()))
    }

    /// Sources configured for `entity`, in registration order.
    pub fn entity_sources(&self, entity: &EntityName) -> &[SourceName] {
        self.entities
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn driver(
        &self,
        entity: &EntityName,
        source: &SourceName,
    ) -> Result<Arc<dyn DataSource>, SourceError> {
        self.sources
            .get(&(entity.clone(), source.clone()))
            .cloned()
            .ok_or_else(|| SourceError {
                entity: entity.clone(),
                source: source.clone(),
                kind: SourceErrorKind::Unregistered,
            })
    }

    pub fn get(&self, fk: &ForeignKey) -> Result<Option<Document>, SourceError> {
        let driver = self.driver(&fk.entity, &fk.source)?;
        let id = fk.id.clone();
        self.bounded(&fk.entity, &fk.source, move || driver.get(&id))
    }

    /// Write `doc`; with no foreign key the source allocates one. Returns
    /// the (possibly fresh) foreign key for the written copy.
    pub fn set(
        &self,
        entity: &EntityName,
        source: &SourceName,
        fk: Option<&ForeignKey>,
        doc: &Document,
    ) -> Result<ForeignKey, SourceError> {
        let driver = self.driver(entity, source)?;
        let id = fk.map(|fk| fk.id.clone());
        let doc_owned = doc.clone();
        let assigned = self.bounded(entity, source, move || {
            driver.set(id.as_deref(), &doc_owned)
        })?;
        Ok(ForeignKey::new(entity.clone(), source.clone(), assigned))
    }

    pub fn delete(&self, fk: &ForeignKey) -> Result<(), SourceError> {
        let driver = self.driver(&fk.entity, &fk.source)?;
        let id = fk.id.clone();
        self.bounded(&fk.entity, &fk.source, move || driver.delete(&id))
    }

    /// Run `call` on a helper thread and wait up to the configured timeout.
    fn bounded<T: Send + 'static>(
        &self,
        entity: &EntityName,
        source: &SourceName,
        call: impl FnOnce() -> Result<T, SourceFault> + Send + 'static,
    ) -> Result<T, SourceError> {
        let boundary = |kind: SourceErrorKind| SourceError {
            entity: entity.clone(),
            source: source.clone(),
            kind,
        };

        let (tx, rx) = bounded(1);
        let spawned = std::thread::Builder::new()
            .name(format!("source-{entity}-{source}"))
            .spawn(move || {
                let _ = tx.send(call());
            });
        if let Err(err) = spawned {
            return Err(boundary(SourceErrorKind::Failed(SourceFault(format!(
                "failed to spawn source call: {err}"
            )))));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => Err(boundary(SourceErrorKind::Failed(fault))),
            Err(RecvTimeoutError::Timeout) => {
                Err(boundary(SourceErrorKind::Timeout(self.timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(boundary(SourceErrorKind::Failed(
                SourceFault("source call panicked".to_string()),
            ))),
        }
    }
}
