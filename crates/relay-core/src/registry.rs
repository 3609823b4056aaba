use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RelayError;

type Factory = Arc<dyn Fn(&ServiceRegistry) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

enum Provider {
    Instance(Arc<dyn Any + Send + Sync>),
    Factory(Factory),
}

/// Typed dependency-injection context handed to the coordinator at build time.
///
/// Populated during setup and read-only afterwards; stage actions reach it
/// through their input. Instances are shared, factories build a fresh value
/// on every resolve.
#[derive(Default)]
pub struct ServiceRegistry {
    providers: HashMap<TypeId, Provider>,
    names: HashMap<TypeId, &'static str>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shared instance, replacing any earlier provider for `T`.
    pub fn register_instance<T: Send + Sync + 'static>(&mut self, instance: Arc<T>) {
        self.insert::<T>(Provider::Instance(instance));
    }

    /// Registers a factory run on every resolve of `T`. The factory gets the
    /// registry itself, so it can resolve its own dependencies.
    pub fn register_factory<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceRegistry) -> T + Send + Sync + 'static,
    {
        self.insert::<T>(Provider::Factory(Arc::new(
            move |registry: &ServiceRegistry| -> Arc<dyn Any + Send + Sync> {
                Arc::new(factory(registry))
            },
        )));
    }

    pub fn with_instance<T: Send + Sync + 'static>(mut self, instance: Arc<T>) -> Self {
        self.register_instance(instance);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let erased = match self.providers.get(&TypeId::of::<T>())? {
            Provider::Instance(instance) => instance.clone(),
            Provider::Factory(factory) => factory(self),
        };
        erased.downcast::<T>().ok()
    }

    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, RelayError> {
        self.get::<T>()
            .ok_or(RelayError::MissingService(type_name::<T>()))
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.providers.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn insert<T: 'static>(&mut self, provider: Provider) {
        let id = TypeId::of::<T>();
        if self.providers.insert(id, provider).is_some() {
            tracing::debug!("ServiceRegistry: replaced provider for {}", type_name::<T>());
        }
        self.names.insert(id, type_name::<T>());
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names.values().collect();
        names.sort();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}
