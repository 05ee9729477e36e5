//! Name-keyed catalogue of runnable analyses.
//!
//! Hosts never call a detector directly: they look an analysis up by name,
//! render a form from its parameter schema, and invoke the stored callable
//! with a [`Trace`] and a flat [`Parameters`] map. Registration happens at
//! start-up (built-ins, then plugins); afterwards the registry is read-only
//! in practice, so the interior lock is read-mostly.

use crate::error::{AnalysisError, EngineResult};
use ephys_common::{AnalysisResult, ParameterDescriptor, Parameters, Trace};
use lazy_static::lazy_static;
use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

/// Callable form every analysis is registered under.
pub type AnalysisCallable =
    Arc<dyn Fn(&Trace, &Parameters) -> EngineResult<AnalysisResult> + Send + Sync>;

/// One registered analysis: the callable plus the schemas a host needs to
/// drive it without knowing its internals.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Stable machine name the analysis is looked up by.
    pub name: String,
    /// Human-readable name for menus and table headers.
    pub label: String,
    pub callable: AnalysisCallable,
    pub parameter_schema: Vec<ParameterDescriptor>,
    /// Declares which plot layers the analysis' underscore-prefixed result
    /// keys feed. Free-form JSON, interpreted by the host.
    pub plot_schema: serde_json::Value,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("parameter_schema", &self.parameter_schema)
            .field("plot_schema", &self.plot_schema)
            .finish_non_exhaustive()
    }
}

/// A [`Parameters`] map holding every default declared by `schema`.
pub fn default_parameters(schema: &[ParameterDescriptor]) -> Parameters {
    let mut parameters = Parameters::new();
    for descriptor in schema {
        parameters.set(descriptor.name.clone(), descriptor.default.clone());
    }
    parameters
}

/// Thread-safe analysis catalogue. Instantiable for tests; production code
/// shares the one behind [`global_registry`].
#[derive(Debug, Default)]
pub struct AnalysisRegistry {
    entries: RwLock<BTreeMap<String, Arc<RegistryEntry>>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry` under its name. The first registration of a name wins;
    /// a later attempt is refused so a plugin cannot shadow a built-in.
    pub fn register(&self, entry: RegistryEntry) -> EngineResult<()> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match entries.entry(entry.name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(entry));
                Ok(())
            }
            Entry::Occupied(_) => {
                tracing::warn!("analysis `{}` is already registered", entry.name);
                Err(AnalysisError::DuplicateName(entry.name))
            }
        }
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AnalysisError::NotFound(name.to_owned()))
    }

    /// Every registered entry, in name order.
    pub fn list(&self) -> Vec<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn parameter_schema(&self, name: &str) -> EngineResult<Vec<ParameterDescriptor>> {
        Ok(self.get(name)?.parameter_schema.clone())
    }

    pub fn plot_schema(&self, name: &str) -> EngineResult<serde_json::Value> {
        Ok(self.get(name)?.plot_schema.clone())
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: AnalysisRegistry = AnalysisRegistry::new();
}

/// Process-wide registry shared by the host UI, the plugin loader and the
/// batch runner.
pub fn global_registry() -> &'static AnalysisRegistry {
    &GLOBAL_REGISTRY
}
