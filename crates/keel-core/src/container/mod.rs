//! Constructor-based dependency injection.
//!
//! The [`Container`] builds an object graph from declared constructors. There
//! is no manual wiring order: each constructor declares its dependencies
//! through its parameter types, and resolution walks the graph depth-first.
//!
//! # Resolution
//!
//! To resolve `T`:
//!
//! 1. If `T` is already instantiated, return the cached singleton.
//! 2. If `T` is on the current resolution stack, fail with
//!    [`ContainerError::Cycle`] naming the cycle.
//! 3. Otherwise push `T`, resolve every dependency of its constructor,
//!    call the constructor, cache the result and pop `T`.
//!
//! A type with no constructor fails with
//! [`ContainerError::MissingConstructor`]. A failing constructor is never
//! retried; its error propagates immediately.
//!
//! # Concurrency
//!
//! After boot the container is shared behind an `Arc`. Cached instances are
//! read without locking. Construction is serialised by a single build lock,
//! so a type is constructed at most once even under concurrent first access.
//!
//! ```rust,ignore
//! let mut container = Container::new();
//! container.provide(UserController::new);
//! container.try_provide(Database::connect);
//! container.instance(DbConfig::default());
//!
//! container.warm_up([TypeKey::of::<UserController>()])?;
//! let users: Arc<UserController> = container.resolve()?;
//! ```

mod constructor;

pub use constructor::{Provider, TryProvider};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BoxError, ContainerError, ContainerResult};
use crate::types::TypeKey;

/// A type-erased singleton held by the container.
pub type Instance = Arc<dyn Any + Send + Sync>;

type ConstructFn = Arc<dyn Fn(Vec<Instance>) -> Result<Instance, BoxError> + Send + Sync>;

// =============================================================================
// ConstructorSpec
// =============================================================================

/// A registered constructor: its output type, its declared dependencies and
/// the type-erased function that builds the output from them.
///
/// Immutable once created.
#[derive(Clone)]
pub struct ConstructorSpec {
    output: TypeKey,
    dependencies: Vec<TypeKey>,
    construct: ConstructFn,
}

impl ConstructorSpec {
    /// Creates a spec from an already type-erased constructor.
    ///
    /// `construct` receives the resolved dependencies in declaration order.
    pub fn new<F>(output: TypeKey, dependencies: Vec<TypeKey>, construct: F) -> Self
    where
        F: Fn(Vec<Instance>) -> Result<Instance, BoxError> + Send + Sync + 'static,
    {
        Self {
            output,
            dependencies,
            construct: Arc::new(construct),
        }
    }

    /// The type this constructor produces.
    pub fn output(&self) -> TypeKey {
        self.output
    }

    /// The types this constructor consumes, in parameter order.
    pub fn dependencies(&self) -> &[TypeKey] {
        &self.dependencies
    }
}

impl fmt::Debug for ConstructorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructorSpec")
            .field("output", &self.output)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Node
// =============================================================================

/// One vertex of the dependency graph: a constructor plus its memoized
/// instance. Pre-built instances have no constructor.
struct Node {
    spec: Option<ConstructorSpec>,
    instance: OnceLock<Instance>,
}

impl Node {
    fn constructed(spec: ConstructorSpec) -> Self {
        Self {
            spec: Some(spec),
            instance: OnceLock::new(),
        }
    }

    fn prebuilt(instance: Instance) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(instance);
        Self {
            spec: None,
            instance: cell,
        }
    }
}

// =============================================================================
// Container
// =============================================================================

/// The process-wide singleton container.
///
/// Registration takes `&mut self` and happens at boot. Resolution takes
/// `&self` and is safe to call from any number of tasks.
#[derive(Default)]
pub struct Container {
    nodes: HashMap<TypeKey, Node>,
    build_lock: Mutex<()>,
}

impl Container {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Registers a type-erased constructor.
    ///
    /// Registering a second constructor for the same output type replaces
    /// the first; the last registration wins.
    pub fn register(&mut self, spec: ConstructorSpec) -> &mut Self {
        let key = spec.output();
        if self.nodes.insert(key, Node::constructed(spec)).is_some() {
            warn!(
                ty = key.name(),
                "Duplicate constructor registered, last registration wins"
            );
        } else {
            debug!(ty = key.name(), "Constructor registered");
        }
        self
    }

    /// Registers an infallible constructor `Fn(Arc<A>, ..) -> T`.
    pub fn provide<T, Args, F>(&mut self, constructor: F) -> &mut Self
    where
        F: Provider<T, Args>,
    {
        self.register(constructor.into_spec())
    }

    /// Registers a fallible constructor `Fn(Arc<A>, ..) -> Result<T, E>`.
    pub fn try_provide<T, Args, F>(&mut self, constructor: F) -> &mut Self
    where
        F: TryProvider<T, Args>,
    {
        self.register(constructor.into_spec())
    }

    /// Registers a pre-built singleton.
    pub fn instance<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        let key = TypeKey::of::<T>();
        if self
            .nodes
            .insert(key, Node::prebuilt(Arc::new(value)))
            .is_some()
        {
            warn!(
                ty = key.name(),
                "Duplicate instance registered, last registration wins"
            );
        }
        self
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Returns `true` if a constructor or instance is registered for `key`.
    pub fn contains(&self, key: TypeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    /// Returns `true` if `key` has already been instantiated.
    pub fn is_resolved(&self, key: TypeKey) -> bool {
        self.cached(key).is_some()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the constructor registered for `key`, if any.
    pub fn spec(&self, key: TypeKey) -> Option<&ConstructorSpec> {
        self.nodes.get(&key).and_then(|node| node.spec.as_ref())
    }

    // ─── Resolution ──────────────────────────────────────────────────────────

    /// Resolves `T`, constructing it and its dependencies on first use.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> ContainerResult<Arc<T>> {
        let key = TypeKey::of::<T>();
        self.resolve_key(key)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch { ty: key.name() })
    }

    /// Resolves a type by key, returning the type-erased singleton.
    pub fn resolve_key(&self, key: TypeKey) -> ContainerResult<Instance> {
        if let Some(instance) = self.cached(key) {
            return Ok(instance);
        }

        let _guard = self.build_lock.lock();
        let mut stack = Vec::new();
        self.resolve_locked(key, None, &mut stack)
    }

    /// Eagerly resolves every given type, stopping at the first failure.
    ///
    /// Used at boot to fail fast rather than at first request.
    pub fn warm_up<I>(&self, keys: I) -> ContainerResult<()>
    where
        I: IntoIterator<Item = TypeKey>,
    {
        for key in keys {
            self.resolve_key(key)?;
            debug!(ty = key.name(), "Warmed up");
        }
        Ok(())
    }

    fn cached(&self, key: TypeKey) -> Option<Instance> {
        self.nodes
            .get(&key)
            .and_then(|node| node.instance.get())
            .cloned()
    }

    /// Depth-first resolution. Must be called with `build_lock` held.
    fn resolve_locked(
        &self,
        key: TypeKey,
        required_by: Option<TypeKey>,
        stack: &mut Vec<TypeKey>,
    ) -> ContainerResult<Instance> {
        if let Some(instance) = self.cached(key) {
            return Ok(instance);
        }

        if let Some(start) = stack.iter().position(|visiting| *visiting == key) {
            let mut path: Vec<&'static str> = stack[start..].iter().map(TypeKey::name).collect();
            path.push(key.name());
            return Err(ContainerError::Cycle { path });
        }

        let node = self.nodes.get(&key);
        let Some(spec) = node.and_then(|node| node.spec.as_ref()) else {
            return Err(ContainerError::MissingConstructor {
                ty: key.name(),
                required_by: required_by.map(|owner| owner.name()),
            });
        };

        stack.push(key);
        let built = spec
            .dependencies()
            .iter()
            .map(|dep| self.resolve_locked(*dep, Some(key), stack))
            .collect::<ContainerResult<Vec<_>>>()
            .and_then(|deps| {
                (spec.construct)(deps).map_err(|source| ContainerError::Construction {
                    ty: key.name(),
                    source,
                })
            });
        stack.pop();

        let instance = built?;
        debug!(ty = key.name(), "Constructed singleton");

        // `node` exists: `spec` was borrowed from it.
        if let Some(node) = node {
            let _ = node.instance.set(Arc::clone(&instance));
        }
        Ok(instance)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registered", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Config {
        url: &'static str,
    }

    struct Database {
        url: &'static str,
    }

    struct Cache;

    struct UserService {
        db: Arc<Database>,
        _cache: Arc<Cache>,
    }

    struct Ping;
    struct Pong;

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Registers Config <- Database <- UserService, Cache <- UserService in
    /// the given order and returns the construction log.
    fn build_graph(order: [usize; 4]) -> Vec<&'static str> {
        let seen = log();
        let mut container = Container::new();
        for step in order {
            let seen = Arc::clone(&seen);
            match step {
                0 => {
                    container.provide(move || {
                        seen.lock().push("config");
                        Config { url: "mem://" }
                    });
                }
                1 => {
                    container.provide(move |config: Arc<Config>| {
                        seen.lock().push("database");
                        Database { url: config.url }
                    });
                }
                2 => {
                    container.provide(move || {
                        seen.lock().push("cache");
                        Cache
                    });
                }
                _ => {
                    container.provide(move |db: Arc<Database>, cache: Arc<Cache>| {
                        seen.lock().push("users");
                        UserService { db, _cache: cache }
                    });
                }
            }
        }

        let users = container.resolve::<UserService>().unwrap();
        assert_eq!(users.db.url, "mem://");
        let order = seen.lock().clone();
        order
    }

    #[test]
    fn test_resolution_order_is_invariant_under_registration_order() {
        let expected = build_graph([0, 1, 2, 3]);
        assert_eq!(expected, vec!["config", "database", "cache", "users"]);

        for order in [[3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1], [3, 0, 2, 1]] {
            assert_eq!(build_graph(order), expected, "order {order:?}");
        }
    }

    #[test]
    fn test_singletons_are_constructed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut container = Container::new();
        container.provide(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Cache
        });

        let a = container.resolve::<Cache>().unwrap();
        let b = container.resolve::<Cache>().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(container.is_resolved(TypeKey::of::<Cache>()));
    }

    #[test]
    fn test_cycle_is_reported_not_hung() {
        let mut container = Container::new();
        container.provide(|_pong: Arc<Pong>| Ping);
        container.provide(|_ping: Arc<Ping>| Pong);

        let err = container.resolve::<Ping>().err().unwrap();
        assert!(err.is_cycle(), "unexpected error: {err}");
        let ContainerError::Cycle { path } = err else {
            unreachable!()
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut container = Container::new();
        container.provide(|_me: Arc<Ping>| Ping);

        assert!(container.resolve::<Ping>().err().unwrap().is_cycle());
    }

    #[test]
    fn test_missing_constructor_is_distinct_from_cycle() {
        let mut container = Container::new();
        container.provide(|config: Arc<Config>| Database { url: config.url });

        let err = container.resolve::<Database>().err().unwrap();
        assert!(err.is_missing());
        assert!(!err.is_cycle());
        let ContainerError::MissingConstructor { ty, required_by } = err else {
            unreachable!()
        };
        assert!(ty.ends_with("Config"));
        assert!(required_by.unwrap().ends_with("Database"));
    }

    #[test]
    fn test_last_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (a, b) = (Arc::clone(&first), Arc::clone(&second));

        let mut container = Container::new();
        container.provide(move || {
            a.fetch_add(1, Ordering::SeqCst);
            Config { url: "first" }
        });
        container.provide(move || {
            b.fetch_add(1, Ordering::SeqCst);
            Config { url: "second" }
        });

        assert_eq!(container.len(), 1);
        assert_eq!(container.resolve::<Config>().unwrap().url, "second");
        container.resolve::<Config>().unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_constructor_propagates() {
        let mut container = Container::new();
        container.try_provide(|| -> anyhow::Result<Database> {
            anyhow::bail!("connection refused")
        });
        container.provide(|db: Arc<Database>| UserService {
            db,
            _cache: Arc::new(Cache),
        });

        let err = container.resolve::<UserService>().err().unwrap();
        assert!(matches!(err, ContainerError::Construction { .. }));
        assert!(err.to_string().contains("connection refused"));
        assert!(!container.is_resolved(TypeKey::of::<UserService>()));
    }

    #[test]
    fn test_warm_up_stops_at_first_failure() {
        let mut container = Container::new();
        container.instance(Config { url: "mem://" });
        container.provide(|config: Arc<Config>| Database { url: config.url });

        assert!(
            container
                .warm_up([TypeKey::of::<Database>(), TypeKey::of::<Cache>()])
                .err()
                .unwrap()
                .is_missing()
        );
        assert!(container.is_resolved(TypeKey::of::<Database>()));
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut container = Container::new();
        container.provide(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            Cache
        });
        let container = Arc::new(container);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let container = Arc::clone(&container);
                scope.spawn(move || container.resolve::<Cache>().unwrap());
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
