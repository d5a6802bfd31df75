//! Ordered adapter registry.

use blescale_types::DeviceInfo;
use tracing::trace;

use super::{EsCs20m, MiScale, MiScale2, QnScale, ScaleAdapter, StandardWeight, Yunmai};

/// Builds a fresh adapter instance.
pub type AdapterFactory = fn() -> Box<dyn ScaleAdapter>;

fn build<A: ScaleAdapter + Default + 'static>() -> Box<dyn ScaleAdapter> {
    Box::new(A::default())
}

/// Ordered set of adapter constructors. The first adapter whose
/// [`ScaleAdapter::matches`] accepts a device wins.
///
/// Storing constructors rather than instances means every match gets its own
/// parser state, so nothing leaks between acquisitions.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: Vec<AdapterFactory>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::empty()
            .with(build::<MiScale2>)
            .with(build::<MiScale>)
            .with(build::<QnScale>)
            .with(build::<Yunmai>)
            .with(build::<EsCs20m>)
            .with(build::<StandardWeight>)
    }
}

impl AdapterRegistry {
    /// Registry with every built-in adapter, in priority order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no adapters.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Append an adapter constructor (lowest priority so far).
    #[must_use]
    pub fn with(mut self, factory: AdapterFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Names of the registered adapters, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f().name()).collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no adapters are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Return a fresh instance of the first adapter that recognizes `info`.
    pub fn match_device(&self, info: &DeviceInfo) -> Option<Box<dyn ScaleAdapter>> {
        let adapter = self
            .factories
            .iter()
            .map(|factory| factory())
            .find(|adapter| adapter.matches(info))?;
        trace!(adapter = adapter.name(), name = ?info.name, "Adapter matched");
        Some(adapter)
    }

    /// Build the adapter registered under `name`.
    pub fn by_name(&self, name: &str) -> Option<Box<dyn ScaleAdapter>> {
        self.factories
            .iter()
            .map(|factory| factory())
            .find(|adapter| adapter.name() == name)
    }
}
