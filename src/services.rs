//! Dependency injection seam.
//!
//! The engine only needs two things from a container: a root that can hand
//! out child scopes ([`ScopeFactory`]) and scopes that resolve services and
//! can be disposed ([`ServiceScope`]). [`ServiceCollection`] and
//! [`ServiceProvider`] are the default in-process implementation.
//!
//! Every invocation and every lifecycle phase handler gets its own scope,
//! created fresh and disposed at the end of that unit of work.

use crate::error::HostingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Type-erased service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// A disposable unit-of-work scope.
#[async_trait]
pub trait ServiceScope: Send + Sync {
    /// Resolve a service by type. `None` if unregistered or disposed.
    fn resolve(&self, type_id: TypeId) -> Option<ServiceInstance>;

    /// Release every scoped instance held by this scope.
    async fn dispose(&self);
}

impl<'a> dyn ServiceScope + 'a {
    /// Resolve a typed service.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve(TypeId::of::<T>())
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Resolve a typed service, failing with a binding error when it is missing.
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>, HostingError> {
        self.get::<T>().ok_or_else(|| {
            HostingError::Binding(format!("service {} is not registered", type_name::<T>()))
        })
    }
}

/// Creates child scopes from a root container.
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> Arc<dyn ServiceScope>;
}

type Factory = Arc<dyn Fn(&dyn ServiceScope) -> ServiceInstance + Send + Sync>;

#[derive(Clone)]
enum Registration {
    Singleton(ServiceInstance),
    Scoped(Factory),
    Transient(Factory),
}

/// Mutable service registrations, frozen into a [`ServiceProvider`].
#[derive(Clone, Default)]
pub struct ServiceCollection {
    registrations: HashMap<TypeId, (&'static str, Registration)>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance, visible to every scope.
    pub fn add_singleton<T: Any + Send + Sync>(&mut self, instance: T) -> &mut Self {
        self.insert::<T>(Registration::Singleton(Arc::new(instance)))
    }

    /// Register a factory invoked once per scope.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&dyn ServiceScope) -> T + Send + Sync + 'static,
    {
        self.insert::<T>(Registration::Scoped(Arc::new(move |scope| {
            Arc::new(factory(scope)) as ServiceInstance
        })))
    }

    /// Register a factory invoked on every resolution.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&dyn ServiceScope) -> T + Send + Sync + 'static,
    {
        self.insert::<T>(Registration::Transient(Arc::new(move |scope| {
            Arc::new(factory(scope)) as ServiceInstance
        })))
    }

    /// Whether a service of type `T` is registered.
    pub fn contains<T: Any>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freeze the registrations into a root provider.
    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            registrations: Arc::new(self.registrations),
        }
    }

    fn insert<T: Any>(&mut self, registration: Registration) -> &mut Self {
        let previous = self
            .registrations
            .insert(TypeId::of::<T>(), (type_name::<T>(), registration));
        if previous.is_some() {
            warn!(service = type_name::<T>(), "Service registration replaced");
        }
        self
    }
}

/// Root container, shared read-only across all units of work.
#[derive(Clone)]
pub struct ServiceProvider {
    registrations: Arc<HashMap<TypeId, (&'static str, Registration)>>,
}

impl ServiceProvider {
    /// Resolve a singleton from the root.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.registrations.get(&TypeId::of::<T>()) {
            Some((_, Registration::Singleton(instance))) => instance.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl ScopeFactory for ServiceProvider {
    fn create_scope(&self) -> Arc<dyn ServiceScope> {
        Arc::new(Scope {
            registrations: self.registrations.clone(),
            instances: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.registrations.values().map(|(name, _)| name))
            .finish()
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("services", &self.registrations.len())
            .finish()
    }
}

/// Child scope of a [`ServiceProvider`].
struct Scope {
    registrations: Arc<HashMap<TypeId, (&'static str, Registration)>>,
    instances: Mutex<HashMap<TypeId, ServiceInstance>>,
    disposed: AtomicBool,
}

#[async_trait]
impl ServiceScope for Scope {
    fn resolve(&self, type_id: TypeId) -> Option<ServiceInstance> {
        if self.disposed.load(Ordering::Acquire) {
            warn!("Resolve called on a disposed scope");
            return None;
        }

        let (_, registration) = self.registrations.get(&type_id)?;
        match registration {
            Registration::Singleton(instance) => Some(instance.clone()),
            Registration::Transient(factory) => Some(factory(self)),
            Registration::Scoped(factory) => {
                if let Some(existing) = self.instances.lock().get(&type_id) {
                    return Some(existing.clone());
                }
                // Built outside the lock so the factory may resolve its own dependencies.
                let created = factory(self);
                let mut instances = self.instances.lock();
                Some(instances.entry(type_id).or_insert(created).clone())
            }
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let instances = std::mem::take(&mut *self.instances.lock());
        drop(instances);
    }
}
