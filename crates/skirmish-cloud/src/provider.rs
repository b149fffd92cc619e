use log::info;
use skirmish_core::{EventSink, ProviderConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::ComputeBackend;
use crate::catalog::Catalog;
use crate::error::CloudError;
use crate::gce::GceBackend;
use crate::instance::InstanceMinion;
use crate::minion::{Minion, MinionContext, MinionKind};
use crate::network::NetworkMinion;

pub const GOOGLE_PROVIDER: &str = "google";

/// A named cloud vendor able to build minions for its operations.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn initialise(&self, config: &ProviderConfig) -> Result<(), CloudError>;
    fn is_initialised(&self) -> bool;
    fn minion_factory(&self) -> Result<MinionFactory, CloudError>;
}

/// Builds fresh minions bound to one provider's backend and catalog.
#[derive(Clone)]
pub struct MinionFactory {
    context: MinionContext,
}

impl MinionFactory {
    pub fn new(context: MinionContext) -> Self {
        Self { context }
    }

    pub fn known_operations(&self) -> Vec<String> {
        MinionKind::ALL
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect()
    }

    pub fn create(&self, operation: &str) -> Result<Arc<dyn Minion>, CloudError> {
        let kind = operation
            .parse::<MinionKind>()
            .map_err(|_| CloudError::UnknownOperation {
                provider: self.context.provider.clone(),
                name: operation.to_string(),
                known: self.known_operations(),
            })?;
        let minion: Arc<dyn Minion> = match kind.flow() {
            None => Arc::new(InstanceMinion::new(self.context.clone())),
            Some(flow) => Arc::new(NetworkMinion::new(self.context.clone(), flow)),
        };
        Ok(minion)
    }
}

/// Provider over any `ComputeBackend`. Catalogs are memoised per project set.
pub struct ComputeProvider {
    name: String,
    backend: Arc<dyn ComputeBackend>,
    events: Arc<dyn EventSink>,
    catalogs: Mutex<HashMap<Vec<String>, Arc<Catalog>>>,
    active: Mutex<Option<Arc<Catalog>>>,
}

impl ComputeProvider {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ComputeBackend>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            events,
            catalogs: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// Loads at most once per distinct project set. The map lock is held
    /// across the load so concurrent callers wait for the same result.
    fn catalog_for(&self, projects: &[String]) -> Result<Arc<Catalog>, CloudError> {
        let mut key = projects.to_vec();
        key.sort();
        key.dedup();

        let mut catalogs = self.catalogs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(catalog) = catalogs.get(&key) {
            return Ok(Arc::clone(catalog));
        }
        let catalog = Arc::new(Catalog::load(self.backend.as_ref(), &key)?);
        info!(
            "provider {} preloaded {} zone(s) across {} project(s)",
            self.name,
            catalog.zones.len(),
            key.len()
        );
        catalogs.insert(key, Arc::clone(&catalog));
        Ok(catalog)
    }
}

impl Provider for ComputeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialise(&self, config: &ProviderConfig) -> Result<(), CloudError> {
        self.backend.connect()?;
        let catalog = self.catalog_for(&config.projects)?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(catalog);
        Ok(())
    }

    fn is_initialised(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn minion_factory(&self) -> Result<MinionFactory, CloudError> {
        let catalog = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CloudError::NotInitialised {
                provider: self.name.clone(),
            })?;
        Ok(MinionFactory::new(MinionContext {
            provider: self.name.clone(),
            backend: Arc::clone(&self.backend),
            catalog,
            events: Arc::clone(&self.events),
        }))
    }
}

/// Providers by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in providers: Google Compute Engine.
    pub fn with_defaults(events: Arc<dyn EventSink>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ComputeProvider::new(
            GOOGLE_PROVIDER,
            Arc::new(GceBackend::from_env()),
            events,
        )));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
