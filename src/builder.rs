use std::{future::Future, sync::Arc};

use anyhow::Result;

use codec::{
    message::{Args, Kwargs},
    value::Value,
};
use service::{
    cache::DEFAULT_CAPACITY,
    endpoint::{ConstTarget, Endpoint, Handler, InstanceTarget, TableBuilder, TargetKind},
};

use crate::server::{RunningService, ServerOptions, serve};

/// Registers the endpoints of one service and starts it.
///
/// Endpoints can be added until the service is served; serving
/// consumes the builder and freezes the table, so late registration
/// does not compile.
pub struct ServiceBuilder {
    name: String,
    table: TableBuilder,
    options: ServerOptions,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: TableBuilder::default(),
            options: ServerOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_options(&mut self, options: ServerOptions) -> &mut Self {
        self.options = options;
        self
    }

    pub fn with_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.options.host = host.into();
        self
    }

    /// Register a free function.
    pub fn function<F>(&mut self, name: &str, target: F) -> Result<&mut Self>
    where
        F: Fn(Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |args, kwargs| {
            let result = target(args, kwargs);
            Box::pin(async move { result })
        });

        self.insert(name, TargetKind::Free, handler)
    }

    /// Register a free asynchronous function.
    ///
    /// The future runs to completion on the worker that picked the
    /// connection up; it shares the runtime with the accept loop but
    /// never blocks it.
    pub fn async_function<F, Fut>(&mut self, name: &str, target: F) -> Result<&mut Self>
    where
        F: Fn(Args, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, kwargs| Box::pin(target(args, kwargs)));
        self.insert(name, TargetKind::Free, handler)
    }

    /// Register a function associated with a type but bound to no
    /// instance. Constructor arguments sent by clients are ignored.
    pub fn static_method<F>(&mut self, name: &str, target: F) -> Result<&mut Self>
    where
        F: Fn(Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |args, kwargs| {
            let result = target(args, kwargs);
            Box::pin(async move { result })
        });

        self.insert(name, TargetKind::Static, handler)
    }

    /// Register a method on instances of `T`.
    ///
    /// `ctor` builds one `T` per distinct constructor argument set;
    /// instances live in the endpoint's sharded LRU (capacity 128).
    pub fn instance<T, C, M>(&mut self, name: &str, ctor: C, method: M) -> Result<&mut Self>
    where
        T: Send + Sync + 'static,
        C: Fn(&Args, &Kwargs) -> Result<T> + Send + Sync + 'static,
        M: Fn(Arc<T>, Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        self.instance_with_capacity(name, DEFAULT_CAPACITY, ctor, method)
    }

    pub fn instance_with_capacity<T, C, M>(
        &mut self,
        name: &str,
        cache_capacity: usize,
        ctor: C,
        method: M,
    ) -> Result<&mut Self>
    where
        T: Send + Sync + 'static,
        C: Fn(&Args, &Kwargs) -> Result<T> + Send + Sync + 'static,
        M: Fn(Arc<T>, Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        let adapter = InstanceTarget::with_capacity(cache_capacity, ctor, move |instance, args, kwargs| {
            let result = method(instance, args, kwargs);
            Box::pin(async move { result })
        });

        self.table
            .insert(Endpoint::new(name, TargetKind::Instance, Arc::new(adapter)))?;

        Ok(self)
    }

    /// Route `alias` to an already registered endpoint.
    pub fn alias(&mut self, name: &str, alias: &str) -> Result<&mut Self> {
        self.table.alias(name, alias)?;
        Ok(self)
    }

    pub fn endpoint_count(&self) -> usize {
        self.table.len()
    }

    /// Bind, publish and start serving. The endpoint table is frozen
    /// from here on.
    pub async fn serve(self) -> Result<RunningService> {
        serve(self.name, self.table.freeze(), self.options).await
    }

    /// Serve and block until the service is stopped.
    pub async fn run_forever(self) -> Result<()> {
        let running = self.serve().await?;
        running.wait().await;
        running.stop().await
    }

    fn insert(&mut self, name: &str, kind: TargetKind, handler: Handler) -> Result<&mut Self> {
        self.table
            .insert(Endpoint::new(name, kind, Arc::new(ConstTarget::new(handler))))?;

        Ok(self)
    }
}

/// Create a builder for a new service.
pub fn create_service(name: impl Into<String>) -> ServiceBuilder {
    ServiceBuilder::new(name)
}
