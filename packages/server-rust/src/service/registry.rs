use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn FnOnce(&ApplicationContext) -> anyhow::Result<Instance> + Send>;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors raised while composing or querying the application context.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service `{name}` is already registered")]
    DuplicateService { name: String },
    #[error("service `{service}` depends on `{dependency}`, which is not registered")]
    MissingDependency { service: String, dependency: String },
    #[error("cyclic dependency involving `{service}`: {}", .cycle.join(" -> "))]
    CyclicDependency {
        service: String,
        /// Path that closed the loop; first and last entries are the same service.
        cycle: Vec<String>,
    },
    #[error("failed to construct service `{service}`")]
    Factory {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("service `{name}` not found in context")]
    NotFound { name: String },
    #[error("service `{name}` is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

// ---------------------------------------------------------------------------
// ApplicationContext
// ---------------------------------------------------------------------------

/// Named service instances produced by [`ServiceRegistry::build`].
///
/// The context is read-only once built: nothing can be replaced or removed,
/// so it is shared between workers behind an `Arc` without locking.
#[derive(Clone, Default)]
pub struct ApplicationContext {
    services: HashMap<String, Instance>,
    /// Insertion order: seeds first, then services in resolution order.
    order: Vec<String>,
}

impl ApplicationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pre-built value (configuration, clock, test doubles) before `build`.
    ///
    /// Seeds are visible to every factory and may be named as dependencies.
    #[must_use]
    pub fn with_seed<T: Send + Sync + 'static>(mut self, name: &str, value: T) -> Self {
        self.insert(name.to_string(), Arc::new(value));
        self
    }

    /// Like [`with_seed`](Self::with_seed) for a value the caller keeps a handle to.
    #[must_use]
    pub fn with_seed_arc<T: Send + Sync + 'static>(mut self, name: &str, value: Arc<T>) -> Self {
        self.insert(name.to_string(), value);
        self
    }

    fn insert(&mut self, name: String, instance: Instance) {
        if self.services.contains_key(&name) {
            return;
        }
        self.order.push(name.clone());
        self.services.insert(name, instance);
    }

    /// Retrieve a service by name and concrete type.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .get(name)
            .and_then(|instance| Arc::clone(instance).downcast::<T>().ok())
    }

    /// Like [`get`](Self::get), but distinguishes absence from a type mismatch.
    ///
    /// # Errors
    ///
    /// `NotFound` if no service has this name, `TypeMismatch` if it is not a `T`.
    pub fn require<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        let instance = self.services.get(name).ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
        })?;
        Arc::clone(instance)
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Clones a service value out of the context.
    ///
    /// Convenient for services stored as shared handles, e.g. `Arc<dyn SmsService>`.
    #[must_use]
    pub fn instance<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.get::<T>(name).map(|svc| svc.as_ref().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Service names in the order they entered the context.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// A context holding only the named services. Unknown names are skipped.
    #[must_use]
    pub fn scoped<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut view = Self::new();
        for name in names {
            if let Some(instance) = self.services.get(name) {
                view.insert(name.to_string(), Arc::clone(instance));
            }
        }
        view
    }
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("services", &self.order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ServiceDescriptor
// ---------------------------------------------------------------------------

/// Declares a named service, the services it needs, and how to construct it.
pub struct ServiceDescriptor {
    name: String,
    dependencies: Vec<String>,
    factory: Factory,
}

impl ServiceDescriptor {
    /// The factory receives a context containing the seeds and exactly the
    /// declared dependencies. It runs at most once.
    pub fn new<T, F>(name: &str, dependencies: &[&str], factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ApplicationContext) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
            factory: Box::new(move |ctx| factory(ctx).map(|svc| Arc::new(svc) as Instance)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Collects service descriptors and resolves them into an [`ApplicationContext`].
///
/// Resolution is a depth-first topological sort. Roots are visited in
/// registration order and dependencies in declared order, so the
/// instantiation order for a given descriptor set never changes between runs.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor.
    ///
    /// # Errors
    ///
    /// `DuplicateService` if the name is taken; the registry is left unchanged.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
            return Err(RegistryError::DuplicateService {
                name: descriptor.name,
            });
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Registered service names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Instantiates every registered service in dependency order.
    ///
    /// Consumes the registry: factories are one-shot.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found (duplicate, missing, cyclic)
    /// before any factory runs, or the first factory failure. On error the
    /// partially built context is dropped.
    pub fn build(self, initial: ApplicationContext) -> Result<ApplicationContext, RegistryError> {
        if let Some(clash) = self.descriptors.iter().find(|d| initial.contains(&d.name)) {
            return Err(RegistryError::DuplicateService {
                name: clash.name.clone(),
            });
        }

        let order = self.resolution_order(&initial)?;
        let seeds: Vec<String> = initial.names().map(str::to_string).collect();

        let mut slots: Vec<Option<ServiceDescriptor>> =
            self.descriptors.into_iter().map(Some).collect();
        let mut ctx = initial;

        for idx in order {
            let Some(descriptor) = slots[idx].take() else {
                continue;
            };
            let view = ctx.scoped(
                seeds
                    .iter()
                    .chain(descriptor.dependencies.iter())
                    .map(String::as_str),
            );

            debug!(service = %descriptor.name, "instantiating service");
            let instance = (descriptor.factory)(&view).map_err(|source| RegistryError::Factory {
                service: descriptor.name.clone(),
                source,
            })?;
            ctx.insert(descriptor.name, instance);
        }

        info!(services = ctx.len(), "application context built");
        Ok(ctx)
    }

    /// Computes the instantiation order as indices into `descriptors`.
    fn resolution_order(&self, seeds: &ApplicationContext) -> Result<Vec<usize>, RegistryError> {
        let index: HashMap<&str, usize> = self
            .descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.as_str(), i))
            .collect();

        let mut marks = vec![Mark::Unvisited; self.descriptors.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.descriptors.len());

        for start in 0..self.descriptors.len() {
            self.visit(start, &index, seeds, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        index: &HashMap<&str, usize>,
        seeds: &ApplicationContext,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), RegistryError> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|&p| p == idx).unwrap_or_default();
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.descriptors[i].name.clone())
                    .collect();
                cycle.push(self.descriptors[idx].name.clone());
                return Err(RegistryError::CyclicDependency {
                    service: self.descriptors[idx].name.clone(),
                    cycle,
                });
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::InProgress;
        path.push(idx);

        for dep in &self.descriptors[idx].dependencies {
            match index.get(dep.as_str()) {
                Some(&dep_idx) => self.visit(dep_idx, index, seeds, marks, path, order)?,
                None if seeds.contains(dep) => {}
                None => {
                    return Err(RegistryError::MissingDependency {
                        service: self.descriptors[idx].name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
