//! Service registry
//!
//! Owns every service, resolves declared dependencies into an initialization
//! order, injects dependency instances, and drives the lifecycle: `init` in
//! dependency order, `shutdown` in reverse.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::{CoreEvent, ServiceBus};
use crate::service::{
    Dependencies, RecoveryOutcome, Service, ServiceError, ServiceId, ServiceResult, ServiceState,
};

/// Service wrapper with metadata
struct ServiceEntry {
    /// The service instance
    service: Arc<dyn Service>,
    /// Same instance, for typed lookups
    instance: Arc<dyn Any + Send + Sync>,
    /// Declared dependencies, in declaration order
    dependencies: Vec<ServiceId>,
    /// Lifecycle state
    state: ServiceState,
    /// Registration order
    order: usize,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<ServiceId, ServiceEntry>,
    next_order: usize,
    /// Order of the last `initialize`
    init_order: Vec<ServiceId>,
}

impl RegistryState {
    fn registration_order(&self) -> Vec<ServiceId> {
        let mut ids: Vec<(usize, &ServiceId)> =
            self.services.iter().map(|(id, e)| (e.order, id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Depth-first topological sort. Roots are visited in registration order
    /// and dependencies in declaration order, so the result is deterministic.
    fn resolve_order(&self) -> ServiceResult<Vec<ServiceId>> {
        let mut order = Vec::with_capacity(self.services.len());
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for id in self.registration_order() {
            self.visit_service(&id, &mut visited, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit_service(
        &self,
        id: &ServiceId,
        visited: &mut HashSet<ServiceId>,
        path: &mut Vec<ServiceId>,
        order: &mut Vec<ServiceId>,
    ) -> ServiceResult<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| p == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id.clone());
            return Err(ServiceError::CircularDependency { cycle });
        }

        let entry = self
            .services
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;

        path.push(id.clone());
        for dependency in &entry.dependencies {
            if !self.services.contains_key(dependency) {
                return Err(ServiceError::Dependency {
                    service: id.clone(),
                    dependency: dependency.clone(),
                });
            }
            self.visit_service(dependency, visited, path, order)?;
        }
        path.pop();

        visited.insert(id.clone());
        order.push(id.clone());
        Ok(())
    }

    /// Last init order, with services registered since appended
    fn lifecycle_order(&self) -> Vec<ServiceId> {
        let mut order: Vec<ServiceId> = self
            .init_order
            .iter()
            .filter(|id| self.services.contains_key(*id))
            .cloned()
            .collect();
        for id in self.registration_order() {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }
}

/// Outcome of a registry shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Services now destroyed, in shutdown order
    pub destroyed: Vec<ServiceId>,
    /// Services whose `shutdown` failed; they are destroyed regardless
    pub failures: Vec<(ServiceId, ServiceError)>,
}

impl ShutdownReport {
    /// True if every `shutdown` succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Clears the in-progress flag when initialization ends, however it ends
struct InitGuard<'a>(&'a AtomicBool);

impl<'a> InitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> ServiceResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ServiceError::AlreadyInitializing)?;
        Ok(Self(flag))
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Puts a service back to `Uninitialized` if its `init` future is dropped
/// before completing, so a later `initialize` retries it
struct PendingInit<'a> {
    registry: &'a ServiceRegistry,
    id: &'a ServiceId,
    armed: bool,
}

impl PendingInit<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingInit<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Initialization of '{}' was cancelled", self.id);
            self.registry.set_state(self.id.name(), ServiceState::Uninitialized);
        }
    }
}

/// Service registry - manages all game services
pub struct ServiceRegistry {
    state: RwLock<RegistryState>,
    bus: ServiceBus,
    busy: AtomicBool,
}

impl ServiceRegistry {
    /// Create an empty registry publishing lifecycle events on `bus`
    pub fn new(bus: ServiceBus) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            bus,
            busy: AtomicBool::new(false),
        }
    }

    /// The bus lifecycle events go to
    pub fn bus(&self) -> &ServiceBus {
        &self.bus
    }

    /// Register a service along with the dependencies it declares
    pub fn register_service<T: Service>(
        &self,
        id: impl Into<ServiceId>,
        service: Arc<T>,
    ) -> ServiceResult<()> {
        self.insert_service(id.into(), service, Vec::new())
    }

    /// Register a service and add dependencies in one step. Nothing is
    /// registered if the dependencies are invalid.
    pub fn register_with_dependencies<T, I>(
        &self,
        id: impl Into<ServiceId>,
        service: Arc<T>,
        dependencies: I,
    ) -> ServiceResult<()>
    where
        T: Service,
        I: IntoIterator,
        I::Item: Into<ServiceId>,
    {
        let extra = dependencies.into_iter().map(Into::into).collect();
        self.insert_service(id.into(), service, extra)
    }

    fn insert_service<T: Service>(
        &self,
        id: ServiceId,
        service: Arc<T>,
        extra: Vec<ServiceId>,
    ) -> ServiceResult<()> {
        let dependencies = dedup_dependencies(&id, service.dependencies().into_iter().chain(extra))?;

        let mut state = self.state.write();
        if state.services.contains_key(&id) {
            return Err(ServiceError::AlreadyRegistered(id));
        }

        let instance: Arc<dyn Any + Send + Sync> = service.clone();
        let order = state.next_order;
        state.next_order += 1;
        state.services.insert(
            id.clone(),
            ServiceEntry {
                service,
                instance,
                dependencies,
                state: ServiceState::Uninitialized,
                order,
            },
        );

        log::debug!("Registered service '{}' ({})", id, std::any::type_name::<T>());
        Ok(())
    }

    /// Add dependencies to a registered service
    pub fn register_dependencies<I>(&self, id: &str, dependencies: I) -> ServiceResult<()>
    where
        I: IntoIterator,
        I::Item: Into<ServiceId>,
    {
        let service_id = ServiceId::new(id);
        let incoming = dedup_dependencies(&service_id, dependencies.into_iter().map(Into::into))?;

        let mut state = self.state.write();
        let entry = state
            .services
            .get_mut(id)
            .ok_or(ServiceError::NotFound(service_id))?;
        for dependency in incoming {
            if !entry.dependencies.contains(&dependency) {
                entry.dependencies.push(dependency);
            }
        }
        Ok(())
    }

    /// Remove a service, shutting it down if it was initialized. Refused
    /// while other services depend on it.
    pub async fn unregister_service(&self, id: &str) -> ServiceResult<()> {
        let (service, previous) = {
            let mut state = self.state.write();
            let mut dependents: Vec<String> = state
                .services
                .iter()
                .filter(|(other, e)| other.name() != id && e.dependencies.iter().any(|d| d.name() == id))
                .map(|(other, _)| other.to_string())
                .collect();
            if !dependents.is_empty() {
                dependents.sort();
                return Err(ServiceError::Registration {
                    id: id.into(),
                    reason: format!("required by {}", dependents.join(", ")),
                });
            }

            let entry = state
                .services
                .remove(id)
                .ok_or_else(|| ServiceError::NotFound(id.into()))?;
            state.init_order.retain(|other| other.name() != id);
            (entry.service, entry.state)
        };

        if previous.is_initialized() {
            if let Err(error) = service.shutdown().await {
                log::warn!("Service '{}' failed to shut down cleanly: {}", id, error);
            }
            self.bus.publish(CoreEvent::ServiceDestroyed { id: id.into() });
        }
        log::debug!("Unregistered service '{}'", id);
        Ok(())
    }

    /// Get a typed service
    pub fn get_service<T: Send + Sync + 'static>(&self, id: &str) -> ServiceResult<Arc<T>> {
        let instance = self
            .state
            .read()
            .services
            .get(id)
            .map(|e| Arc::clone(&e.instance))
            .ok_or_else(|| ServiceError::NotFound(id.into()))?;

        instance.downcast::<T>().map_err(|_| ServiceError::TypeMismatch {
            id: id.into(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Get a service as a trait object
    pub fn service(&self, id: &str) -> Option<Arc<dyn Service>> {
        self.state.read().services.get(id).map(|e| Arc::clone(&e.service))
    }

    /// Check if a service is registered
    pub fn has_service(&self, id: &str) -> bool {
        self.state.read().services.contains_key(id)
    }

    /// Lifecycle state of a service
    pub fn service_state(&self, id: &str) -> Option<ServiceState> {
        self.state.read().services.get(id).map(|e| e.state)
    }

    /// Registered IDs in registration order
    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.state.read().registration_order()
    }

    /// Declared dependencies of every service
    pub fn dependency_graph(&self) -> BTreeMap<ServiceId, Vec<ServiceId>> {
        self.state
            .read()
            .services
            .iter()
            .map(|(id, e)| (id.clone(), e.dependencies.clone()))
            .collect()
    }

    /// Initialization order without injecting anything
    pub fn initialization_order(&self) -> ServiceResult<Vec<ServiceId>> {
        self.state.read().resolve_order()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.state.read().services.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.state.read().services.is_empty()
    }

    /// Compute the initialization order and hand every service its
    /// dependency instances.
    pub fn resolve_dependencies(&self) -> ServiceResult<Vec<ServiceId>> {
        let (order, injections) = {
            let state = self.state.read();
            let order = state.resolve_order()?;
            let injections: Vec<(ServiceId, Arc<dyn Service>, Dependencies)> = order
                .iter()
                .filter_map(|id| {
                    let entry = state.services.get(id)?;
                    let resolved = entry
                        .dependencies
                        .iter()
                        .filter_map(|dep| {
                            state
                                .services
                                .get(dep)
                                .map(|d| (dep.clone(), Arc::clone(&d.instance)))
                        })
                        .collect();
                    Some((id.clone(), Arc::clone(&entry.service), Dependencies::new(resolved)))
                })
                .collect();
            (order, injections)
        };

        for (id, service, dependencies) in injections {
            service
                .inject(&dependencies)
                .map_err(|e| ServiceError::Initialization {
                    id,
                    source: Box::new(e),
                })?;
        }

        log::debug!("Resolved service order: {}", DisplayIds(&order));
        Ok(order)
    }

    /// Resolve dependencies and initialize every uninitialized service in
    /// order. Stops at the first failure, leaving that service in
    /// [`ServiceState::Error`] and later ones uninitialized.
    pub async fn initialize(&self) -> ServiceResult<()> {
        let _guard = InitGuard::acquire(&self.busy)?;
        let order = self.resolve_dependencies()?;
        self.state.write().init_order = order.clone();

        for id in order {
            let Some(service) = self.begin_init(&id)? else {
                continue;
            };

            log::debug!("Initializing service '{}'", id);
            let pending = PendingInit {
                registry: self,
                id: &id,
                armed: true,
            };
            let result = service.init().await;
            pending.disarm();

            match result {
                Ok(()) => {
                    self.set_state(id.name(), ServiceState::Ready);
                    log::info!("Service '{}' ready", id);
                    self.bus.publish(CoreEvent::ServiceInitialized { id });
                }
                Err(error) => {
                    self.set_state(id.name(), ServiceState::Error);
                    log::error!("Service '{}' failed to initialize: {}", id, error);
                    self.bus.publish(CoreEvent::ServiceError {
                        id: id.clone(),
                        error: error.to_string(),
                    });
                    return Err(ServiceError::Initialization {
                        id,
                        source: Box::new(error),
                    });
                }
            }
        }

        Ok(())
    }

    fn begin_init(&self, id: &ServiceId) -> ServiceResult<Option<Arc<dyn Service>>> {
        let mut state = self.state.write();
        let Some(entry) = state.services.get(id) else {
            return Ok(None);
        };
        if entry.state != ServiceState::Uninitialized {
            return Ok(None);
        }

        for dependency in &entry.dependencies {
            let dependency_state = state
                .services
                .get(dependency)
                .map(|d| d.state)
                .unwrap_or(ServiceState::Destroyed);
            if !dependency_state.is_operational() && dependency_state != ServiceState::Paused {
                return Err(ServiceError::Initialization {
                    id: id.clone(),
                    source: Box::new(ServiceError::operation(format!(
                        "dependency '{}' is {}",
                        dependency, dependency_state
                    ))),
                });
            }
        }

        let entry = state
            .services
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        entry.state = ServiceState::Initializing;
        Ok(Some(Arc::clone(&entry.service)))
    }

    /// Shut every service down in reverse initialization order. Failures are
    /// logged and collected; every service ends up destroyed.
    pub async fn shutdown(&self) -> ServiceResult<ShutdownReport> {
        let _guard = InitGuard::acquire(&self.busy)?;
        let order = self.state.read().lifecycle_order();
        let mut report = ShutdownReport::default();

        for id in order.into_iter().rev() {
            let (service, previous) = {
                let state = self.state.read();
                let Some(entry) = state.services.get(&id) else {
                    continue;
                };
                if entry.state == ServiceState::Destroyed {
                    continue;
                }
                (Arc::clone(&entry.service), entry.state)
            };

            if previous.is_initialized() {
                if let Err(error) = service.shutdown().await {
                    log::warn!("Service '{}' failed to shut down cleanly: {}", id, error);
                    report.failures.push((id.clone(), error));
                }
            }

            self.set_state(id.name(), ServiceState::Destroyed);
            log::debug!("Service '{}' destroyed", id);
            self.bus.publish(CoreEvent::ServiceDestroyed { id: id.clone() });
            report.destroyed.push(id);
        }

        self.state.write().init_order.clear();
        Ok(report)
    }

    /// Shut everything down and forget every service
    pub async fn destroy_all(&self) -> ServiceResult<ShutdownReport> {
        let report = self.shutdown().await?;
        let mut state = self.state.write();
        state.services.clear();
        state.next_order = 0;
        Ok(report)
    }

    /// Pause a ready service that supports it
    pub fn pause(&self, id: &str) -> ServiceResult<()> {
        let service = self.checked_transition(id, ServiceState::Paused)?;
        let pausable = service.as_pausable().ok_or_else(|| ServiceError::Unsupported {
            id: id.into(),
            capability: "pause",
        })?;
        pausable.pause();
        self.set_state(id, ServiceState::Paused);
        log::debug!("Service '{}' paused", id);
        Ok(())
    }

    /// Resume a paused service
    pub fn resume(&self, id: &str) -> ServiceResult<()> {
        let service = self.checked_transition(id, ServiceState::Ready)?;
        let current = self.service_state(id).unwrap_or(ServiceState::Destroyed);
        if current != ServiceState::Paused {
            return Err(ServiceError::InvalidTransition {
                id: id.into(),
                from: current,
                to: ServiceState::Ready,
            });
        }
        let pausable = service.as_pausable().ok_or_else(|| ServiceError::Unsupported {
            id: id.into(),
            capability: "resume",
        })?;
        pausable.resume();
        self.set_state(id, ServiceState::Ready);
        log::debug!("Service '{}' resumed", id);
        Ok(())
    }

    /// Mark a running service as failed
    pub fn report_failure(&self, id: &str, error: impl fmt::Display) -> ServiceResult<()> {
        self.checked_transition(id, ServiceState::Error)?;
        self.set_state(id, ServiceState::Error);
        log::error!("Service '{}' failed: {}", id, error);
        self.bus.publish(CoreEvent::ServiceError {
            id: id.into(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Run a failed or degraded service's recovery
    pub async fn recover(&self, id: &str) -> ServiceResult<RecoveryOutcome> {
        let service = self.checked_transition(id, ServiceState::Recovering)?;
        self.set_state(id, ServiceState::Recovering);
        log::info!("Recovering service '{}'", id);

        match service.recover().await {
            Ok(RecoveryOutcome::Recovered) => {
                self.set_state(id, ServiceState::Ready);
                log::info!("Service '{}' recovered", id);
                Ok(RecoveryOutcome::Recovered)
            }
            Ok(RecoveryOutcome::Degraded) => {
                self.set_state(id, ServiceState::Degraded);
                log::warn!("Service '{}' recovered in degraded mode", id);
                Ok(RecoveryOutcome::Degraded)
            }
            Err(error) => {
                self.set_state(id, ServiceState::Error);
                log::error!("Service '{}' failed to recover: {}", id, error);
                self.bus.publish(CoreEvent::ServiceError {
                    id: id.into(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Tick every operational service that wants updates
    pub fn update_all(&self, dt: f32) {
        let services: Vec<Arc<dyn Service>> = {
            let state = self.state.read();
            state
                .lifecycle_order()
                .iter()
                .filter_map(|id| state.services.get(id))
                .filter(|e| e.state.is_operational())
                .map(|e| Arc::clone(&e.service))
                .collect()
        };

        for service in &services {
            if let Some(updatable) = service.as_updatable() {
                updatable.update(dt);
            }
        }
    }

    fn checked_transition(&self, id: &str, next: ServiceState) -> ServiceResult<Arc<dyn Service>> {
        let state = self.state.read();
        let entry = state
            .services
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(id.into()))?;
        if !entry.state.can_transition_to(next) {
            return Err(ServiceError::InvalidTransition {
                id: id.into(),
                from: entry.state,
                to: next,
            });
        }
        Ok(Arc::clone(&entry.service))
    }

    fn set_state(&self, id: &str, next: ServiceState) {
        if let Some(entry) = self.state.write().services.get_mut(id) {
            log::trace!("Service '{}': {} -> {}", id, entry.state, next);
            entry.state = next;
        }
    }
}

fn dedup_dependencies(
    id: &ServiceId,
    dependencies: impl IntoIterator<Item = ServiceId>,
) -> ServiceResult<Vec<ServiceId>> {
    let mut unique: Vec<ServiceId> = Vec::new();
    for dependency in dependencies {
        if &dependency == id {
            return Err(ServiceError::CircularDependency {
                cycle: vec![id.clone(), id.clone()],
            });
        }
        if !unique.contains(&dependency) {
            unique.push(dependency);
        }
    }
    Ok(unique)
}

struct DisplayIds<'a>(&'a [ServiceId]);

impl fmt::Display for DisplayIds<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", id)?;
        }
        Ok(())
    }
}
