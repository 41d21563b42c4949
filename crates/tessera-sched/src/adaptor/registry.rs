//! Adaptor registry keyed by URL scheme.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::condor::CondorAdaptor;
use super::loadl::LoadLevelerAdaptor;
use super::lsf::LsfAdaptor;
use super::noop::NoopAdaptor;
use super::pbs::PbsAdaptor;
use super::sge::SgeAdaptor;
use super::slurm::SlurmAdaptor;
use super::{AdaptorContext, SchedulerAdaptor};
use crate::config::PbsFlavor;
use crate::error::{SchedError, SchedResult};

/// Constructor of an adaptor for a given context.
pub type AdaptorFactory =
    Box<dyn Fn(AdaptorContext) -> SchedResult<Arc<dyn SchedulerAdaptor>> + Send + Sync>;

/// Maps URL schemes to adaptor factories.
pub struct AdaptorRegistry {
    factories: FxHashMap<String, AdaptorFactory>,
}

impl AdaptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Registry with every backend shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (scheme, flavor) in [
            ("pbs", PbsFlavor::Pbs),
            ("pbspro", PbsFlavor::PbsPro),
            ("torque", PbsFlavor::Torque),
        ] {
            registry.register_factory(scheme, move |ctx| {
                let flavor = ctx.config.backend.pbs_flavor.unwrap_or(flavor);
                Ok(Arc::new(PbsAdaptor::new(ctx, flavor)))
            });
        }
        registry.register_factory("slurm", |ctx| Ok(Arc::new(SlurmAdaptor::new(ctx))));
        registry.register_factory("sge", |ctx| Ok(Arc::new(SgeAdaptor::new(ctx))));
        registry.register_factory("lsf", |ctx| Ok(Arc::new(LsfAdaptor::new(ctx))));
        registry.register_factory("loadl", |ctx| Ok(Arc::new(LoadLevelerAdaptor::new(ctx))));
        registry.register_factory("condor", |ctx| Ok(Arc::new(CondorAdaptor::new(ctx))));
        registry.register_factory("noop", |ctx| {
            Ok(Arc::new(
                NoopAdaptor::new().with_backend(ctx.config.backend.clone()),
            ))
        });
        registry
    }

    /// Register a factory for `scheme`, replacing any previous one.
    pub fn register_factory(
        &mut self,
        scheme: impl Into<String>,
        factory: impl Fn(AdaptorContext) -> SchedResult<Arc<dyn SchedulerAdaptor>>
        + Send
        + Sync
        + 'static,
    ) {
        let scheme = scheme.into();
        debug!("Registering adaptor: {}", scheme);
        self.factories.insert(scheme, Box::new(factory));
    }

    /// Create the adaptor for the context's URL scheme.
    pub fn create(&self, ctx: AdaptorContext) -> SchedResult<Arc<dyn SchedulerAdaptor>> {
        let scheme = ctx.url.scheme().to_string();
        let factory = self
            .factories
            .get(&scheme)
            .ok_or_else(|| SchedError::UnknownBackend(scheme.clone()))?;
        factory(ctx)
    }

    /// Registered schemes, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
