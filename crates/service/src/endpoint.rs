use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Result;

use codec::{
    message::{Args, Kwargs},
    value::Value,
};

use crate::{
    BoxFuture,
    cache::{DEFAULT_CAPACITY, InstanceKey, ShardedCache},
    error::BridgeError,
};

/// A remote-callable target, boxed behind one signature.
pub type Handler = Arc<dyn Fn(Args, Kwargs) -> BoxFuture<Result<Value>> + Send + Sync>;

/// How an endpoint produces the callable it invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A plain function; constructor arguments are ignored.
    Free,
    /// A function associated with a type but bound to no instance.
    Static,
    /// A method on an instance built from the request's constructor
    /// arguments and held in the endpoint's cache.
    Instance,
}

/// One decoded call, ready for dispatch.
pub struct Invocation {
    pub args: Args,
    pub kwargs: Kwargs,
    pub ctor_args: Args,
    pub ctor_kwargs: Kwargs,
}

/// Resolves an invocation to a concrete target and runs it.
pub trait TargetAdapter: Send + Sync {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<Result<Value>>;
}

/// Constant adapter for free and static targets.
pub struct ConstTarget {
    handler: Handler,
}

impl ConstTarget {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

impl TargetAdapter for ConstTarget {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<Result<Value>> {
        (self.handler)(invocation.args, invocation.kwargs)
    }
}

/// Adapter for instance-bound targets.
///
/// The instance is fetched from (or built into) a sharded LRU keyed
/// by the canonical form of the constructor arguments. Aliases share
/// the endpoint and therefore the cache.
pub struct InstanceTarget<T> {
    ctor: Arc<dyn Fn(&Args, &Kwargs) -> Result<T> + Send + Sync>,
    method: Arc<dyn Fn(Arc<T>, Args, Kwargs) -> BoxFuture<Result<Value>> + Send + Sync>,
    cache: ShardedCache<T>,
}

impl<T> InstanceTarget<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        ctor: impl Fn(&Args, &Kwargs) -> Result<T> + Send + Sync + 'static,
        method: impl Fn(Arc<T>, Args, Kwargs) -> BoxFuture<Result<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, ctor, method)
    }

    pub fn with_capacity(
        total_capacity: usize,
        ctor: impl Fn(&Args, &Kwargs) -> Result<T> + Send + Sync + 'static,
        method: impl Fn(Arc<T>, Args, Kwargs) -> BoxFuture<Result<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctor: Arc::new(ctor),
            method: Arc::new(method),
            cache: ShardedCache::new(total_capacity),
        }
    }
}

impl<T> TargetAdapter for InstanceTarget<T>
where
    T: Send + Sync + 'static,
{
    fn invoke(&self, invocation: Invocation) -> BoxFuture<Result<Value>> {
        let key = match InstanceKey::new(&invocation.ctor_args, &invocation.ctor_kwargs) {
            Ok(key) => key,
            Err(err) => return Box::pin(async move { Err(err.into()) }),
        };

        let instance = match self.cache.get_or_create(key, || {
            (self.ctor)(&invocation.ctor_args, &invocation.ctor_kwargs)
        }) {
            Ok(instance) => instance,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        (self.method)(instance, invocation.args, invocation.kwargs)
    }
}

/// A named remotely invocable procedure.
pub struct Endpoint {
    name: String,
    kind: TargetKind,
    adapter: Arc<dyn TargetAdapter>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, kind: TargetKind, adapter: Arc<dyn TargetAdapter>) -> Self {
        Self {
            name: name.into(),
            kind,
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn invoke(&self, invocation: Invocation) -> BoxFuture<Result<Value>> {
        self.adapter.invoke(invocation)
    }
}

/// Collects endpoints before the service starts serving.
#[derive(Default)]
pub struct TableBuilder {
    entries: AHashMap<String, Arc<Endpoint>>,
}

impl TableBuilder {
    pub fn insert(&mut self, endpoint: Endpoint) -> Result<(), BridgeError> {
        let name = endpoint.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(BridgeError::Arg(format!(
                "endpoint {:?} is already registered",
                name
            )));
        }

        self.entries.insert(name, Arc::new(endpoint));
        Ok(())
    }

    /// Route `alias` to an already registered endpoint. The alias
    /// shares the endpoint entry, including its instance cache.
    pub fn alias(&mut self, name: &str, alias: &str) -> Result<(), BridgeError> {
        let endpoint = self
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;

        if self.entries.contains_key(alias) {
            return Err(BridgeError::Arg(format!(
                "endpoint {:?} is already registered",
                alias
            )));
        }

        self.entries.insert(alias.to_string(), endpoint);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the table. From here on lookups are lock-free and the
    /// set of endpoints cannot change.
    pub fn freeze(self) -> EndpointTable {
        EndpointTable {
            entries: self.entries,
        }
    }
}

/// The frozen endpoint table.
pub struct EndpointTable {
    entries: AHashMap<String, Arc<Endpoint>>,
}

impl EndpointTable {
    pub fn get(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.entries.get(name)
    }

    /// All registered names, lexicographically sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.entries.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
