//! apps kubehub – carto.run resources and the watch/get seams the wait engine consumes.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use futures::{stream, stream::BoxStream, StreamExt};
use kube::{
    api::Api,
    core::NamespaceResourceScope,
    runtime::watcher::{self, Event},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use apps_core::NamespacedName;

pub mod crd;

pub use crd::{ClusterSupplyChain, GitRef, GitSource, Workload, LOCAL_SOURCE_PROXY_ANNOTATION, WORKLOAD_LABEL_NAME};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("watch failed: {0}")]
    Watch(#[from] watcher::Error),
    #[error("{kind} {target} not found")]
    NotFound { kind: String, target: String },
}

impl Error {
    /// True for a missing object, whether reported by the API server or a fake.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A change observed on a watched object. Adds and modifications are both `Applied`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Opens a typed watch over all objects of kind `K` in one namespace.
/// Dropping the returned stream stops the watch.
pub trait ObjectWatcher<K>: Send + Sync {
    fn watch(&self, namespace: &str) -> Result<EventStream<K>>;
}

/// Typed single-object read. A missing object must satisfy [`Error::is_not_found`].
#[async_trait::async_trait]
pub trait ObjectGetter<K>: Send + Sync {
    async fn get(&self, target: &NamespacedName) -> Result<K>;
}

/// kube-rs backed watch + get for a namespaced kind.
#[derive(Clone)]
pub struct KubeObjects {
    client: Client,
}

impl KubeObjects {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    pub fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl<K> ObjectWatcher<K> for KubeObjects
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    fn watch(&self, namespace: &str) -> Result<EventStream<K>> {
        let api: Api<K> = self.api(namespace);
        debug!(ns = %namespace, kind = %K::kind(&Default::default()), "watch opened");
        let events = watcher::watcher(api, watcher::Config::default()).flat_map(|res| {
            let items: Vec<Result<WatchEvent<K>>> = match res {
                Ok(Event::Applied(o)) => vec![Ok(WatchEvent::Applied(o))],
                Ok(Event::Deleted(o)) => vec![Ok(WatchEvent::Deleted(o))],
                // A (re)list replays every current object as applied.
                Ok(Event::Restarted(list)) => list.into_iter().map(|o| Ok(WatchEvent::Applied(o))).collect(),
                Err(e) => vec![Err(Error::Watch(e))],
            };
            stream::iter(items)
        });
        Ok(events.boxed())
    }
}

#[async_trait::async_trait]
impl<K> ObjectGetter<K> for KubeObjects
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, target: &NamespacedName) -> Result<K> {
        let api: Api<K> = self.api(&target.namespace);
        Ok(api.get(&target.name).await?)
    }
}
