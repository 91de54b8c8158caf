//! Capability container
//!
//! Type-keyed registry of lazily constructed singletons shared by the agent
//! host. Capabilities come from three places:
//! - [`Service`] types, built by `S::create` on first [`Container::get`]
//! - factories registered with [`Container::provide`], typically for trait
//!   objects such as `dyn ModelClient`
//! - instances injected with [`Container::set`], which replace anything cached
//!
//! Each key owns an async init cell so racing first resolutions construct one
//! instance. Construction receives a child container that remembers the
//! resolution path; asking for a type already on that path is reported as a
//! [`Error::CircularDependency`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::any::{type_name, Any, TypeId};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::prompt::{MemoryPromptStore, PromptStore};
use crate::secrets::SecretsProvider;

/// A capability the container knows how to build itself.
#[async_trait]
pub trait Service: Send + Sync + Sized + 'static {
    async fn create(container: &Container) -> anyhow::Result<Self>;

    /// Called once by [`Container::destroy`].
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

trait Dispose: Send + Sync {
    fn dispose(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

impl<S: Service> Dispose for S {
    fn dispose(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Service::dispose(self)
    }
}

type Instance = Box<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(Container) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

struct Entry {
    name: &'static str,
    /// Always an `Arc<T>` for the slot's key `T`.
    instance: Instance,
    disposer: Option<Arc<dyn Dispose>>,
    seq: u64,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Entry>,
}

struct Inner {
    config: Arc<Config>,
    secrets: Arc<dyn SecretsProvider>,
    slots: DashMap<TypeId, Arc<Slot>>,
    factories: DashMap<TypeId, Factory>,
    seq: AtomicU64,
}

#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
    path: Vec<(TypeId, &'static str)>,
}

impl Container {
    pub fn new(config: Config, secrets: Arc<dyn SecretsProvider>) -> Self {
        let container = Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                secrets,
                slots: DashMap::new(),
                factories: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
            path: Vec::new(),
        };
        container.provide::<dyn PromptStore, _, _>(|_| async {
            Ok(Arc::new(MemoryPromptStore::default()) as Arc<dyn PromptStore>)
        });
        container
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn secrets(&self) -> Arc<dyn SecretsProvider> {
        self.inner.secrets.clone()
    }

    /// Handle onto the same container with an empty resolution path, for
    /// services that keep the container past their own construction.
    pub fn root(&self) -> Container {
        Container {
            inner: self.inner.clone(),
            path: Vec::new(),
        }
    }

    /// Resolve a [`Service`], constructing it on first use.
    pub async fn get<S: Service>(&self) -> Result<Arc<S>> {
        let key = TypeId::of::<S>();
        let name = type_name::<S>();
        self.check_cycle(key, name)?;
        let slot = self.slot(key);
        let child = self.descend(key, name);
        let entry = slot
            .cell
            .get_or_try_init(|| async move {
                debug!(capability = name, "Constructing capability");
                let service = S::create(&child)
                    .await
                    .map_err(|source| Error::CapabilityInit { name, source })?;
                let service = Arc::new(service);
                let disposer: Arc<dyn Dispose> = service.clone();
                Ok::<_, Error>(Entry {
                    name,
                    instance: Box::new(service),
                    disposer: Some(disposer),
                    seq: self.next_seq(),
                })
            })
            .await?;
        downcast::<S>(entry)
    }

    /// Resolve any capability with an injected instance or a provided factory.
    pub async fn resolve<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        let name = type_name::<T>();
        self.check_cycle(key, name)?;
        let slot = self.slot(key);
        if let Some(entry) = slot.cell.get() {
            return downcast::<T>(entry);
        }
        let factory = self
            .inner
            .factories
            .get(&key)
            .map(|f| f.value().clone())
            .ok_or(Error::MissingCapability(name))?;
        let child = self.descend(key, name);
        let entry = slot
            .cell
            .get_or_try_init(|| async move {
                debug!(capability = name, "Constructing capability from factory");
                let instance = factory(child)
                    .await
                    .map_err(|source| Error::CapabilityInit { name, source })?;
                Ok::<_, Error>(Entry {
                    name,
                    instance,
                    disposer: None,
                    seq: self.next_seq(),
                })
            })
            .await?;
        downcast::<T>(entry)
    }

    /// Register a lazy factory for `T`, replacing any earlier factory.
    pub fn provide<T, F, Fut>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Container) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let factory: Factory = Arc::new(move |container| {
            let fut = factory(container);
            async move { Ok(Box::new(fut.await?) as Instance) }.boxed()
        });
        self.inner.factories.insert(TypeId::of::<T>(), factory);
    }

    /// Inject an instance for `T`, replacing any cached one.
    pub fn set<T>(&self, instance: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = Entry {
            name: type_name::<T>(),
            instance: Box::new(instance),
            disposer: None,
            seq: self.next_seq(),
        };
        let slot = Slot {
            cell: OnceCell::new_with(Some(entry)),
        };
        self.inner.slots.insert(TypeId::of::<T>(), Arc::new(slot));
    }

    /// Whether an instance of `T` has been constructed or injected.
    pub fn is_cached<T: ?Sized + 'static>(&self) -> bool {
        self.inner
            .slots
            .get(&TypeId::of::<T>())
            .is_some_and(|slot| slot.cell.initialized())
    }

    /// Dispose every cached service, newest first, and clear the cache.
    ///
    /// Dispose failures are logged and do not stop the teardown.
    pub async fn destroy(&self) {
        let slots: Vec<Arc<Slot>> = self
            .inner
            .slots
            .iter()
            .map(|slot| slot.value().clone())
            .collect();
        self.inner.slots.clear();

        let mut entries: Vec<&Entry> = slots.iter().filter_map(|s| s.cell.get()).collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        for entry in entries {
            let Some(disposer) = &entry.disposer else {
                continue;
            };
            match disposer.dispose().await {
                Ok(()) => debug!(capability = entry.name, "Disposed capability"),
                Err(e) => warn!(capability = entry.name, error = %e, "Capability dispose failed"),
            }
        }
    }

    fn slot(&self, key: TypeId) -> Arc<Slot> {
        self.inner
            .slots
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::default()))
            .value()
            .clone()
    }

    fn check_cycle(&self, key: TypeId, name: &'static str) -> Result<()> {
        if !self.path.iter().any(|(id, _)| *id == key) {
            return Ok(());
        }
        let chain: Vec<&str> = self
            .path
            .iter()
            .map(|(_, n)| *n)
            .chain(std::iter::once(name))
            .collect();
        Err(Error::CircularDependency(chain.join(" -> ")))
    }

    fn descend(&self, key: TypeId, name: &'static str) -> Container {
        let mut path = self.path.clone();
        path.push((key, name));
        Container {
            inner: self.inner.clone(),
            path,
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn downcast<T: ?Sized + Send + Sync + 'static>(entry: &Entry) -> Result<Arc<T>> {
    entry
        .instance
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or(Error::MissingCapability(type_name::<T>()))
}
