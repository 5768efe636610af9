//! Host dispatch entry points.
//!
//! [`BridgeRuntime`] boots one [`GuestInstance`] lazily on the first
//! dispatch and reuses it for every later one. Each entry point runs guest
//! code behind a panic guard; a guest failure is reported best-effort to
//! the host and then surfaced as a fault.

pub mod instance;

use crate::actor::{ActorContext, ActorFactory, ActorInstance, ActorMetadata, GuestActor};
use crate::bridge::HostBridge;
use crate::config::BridgeConfig;
use crate::context::{GuestValue, HostRequest, HostResponse, ScheduledEvent};
use crate::envelope::panic_message;
use crate::error::{BridgeError, Result, RuntimeError};
use crate::handles::Handle;
use crate::host::{DurableStorage, HostEnv};
use crate::metrics::{BridgeMetrics, BridgeStats, DispatchKind};
use crate::queue::{NativeBatch, QueueBatch};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

pub use instance::GuestInstance;

/// Guest application entry points
#[async_trait]
pub trait GuestApp: Send + Sync {
    /// Handle an HTTP request
    async fn fetch(&self, bridge: &HostBridge, request: HostRequest) -> anyhow::Result<GuestValue>;

    /// Handle a scheduled tick
    async fn scheduled(&self, _bridge: &HostBridge, _event: ScheduledEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a queue delivery
    async fn queue(&self, _bridge: &HostBridge, _batch: QueueBatch) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-isolate runtime: lazily boots and memoizes one guest instance
pub struct BridgeRuntime {
    /// Bridge configuration
    config: BridgeConfig,
    /// Guest application
    app: Arc<dyn GuestApp>,
    /// Actor factories by binding
    factories: HashMap<String, ActorFactory>,
    /// The booted instance
    instance: OnceCell<Arc<GuestInstance>>,
    /// Metrics collector
    metrics: Arc<BridgeMetrics>,
}

impl BridgeRuntime {
    /// Create a runtime; nothing is booted until the first dispatch
    pub fn new(config: BridgeConfig, app: Arc<dyn GuestApp>) -> Result<Self> {
        config.validate()?;

        info!(
            masking_policy = ?config.masking_policy,
            fetch_timeout_ms = config.fetch_timeout_ms,
            max_rewrite_handlers = config.max_rewrite_handlers,
            "Initializing bridge runtime"
        );

        Ok(Self {
            config,
            app,
            factories: HashMap::new(),
            instance: OnceCell::new(),
            metrics: Arc::new(BridgeMetrics::new()),
        })
    }

    /// Register the actor implementation for `binding`
    pub fn with_actor<F>(mut self, binding: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ActorContext) -> Arc<dyn GuestActor> + Send + Sync + 'static,
    {
        self.factories.insert(binding.into(), Arc::new(factory));
        self
    }

    /// The instance, booted over `env` on first use
    pub async fn instance(&self, env: &HostEnv) -> Result<Arc<GuestInstance>> {
        self.instance
            .get_or_try_init(|| async {
                GuestInstance::boot(
                    &self.config,
                    env.clone(),
                    self.factories.clone(),
                    Arc::clone(&self.metrics),
                )
                .map(Arc::new)
            })
            .await
            .map(Arc::clone)
    }

    /// The instance, if already booted
    pub fn booted(&self) -> Option<&Arc<GuestInstance>> {
        self.instance.get()
    }

    /// Handle an HTTP request.
    ///
    /// A guest failure becomes a 500 whose body is the (masked) message.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn handle_request(&self, env: &HostEnv, request: HostRequest) -> Result<HostResponse> {
        let instance = self.instance(env).await?;
        let context = json!({"dispatch": DispatchKind::Request.as_str(), "path": request.path});

        match guarded(self.app.fetch(instance.bridge(), request)).await {
            Ok(value) => {
                self.metrics.record_dispatch(DispatchKind::Request, true);
                Ok(value.into_response())
            }
            Err(error) => {
                self.fail(&instance, DispatchKind::Request, &error, context).await;
                let message = instance.masker().mask(&error).message;
                Ok(HostResponse::new(500, message)
                    .with_header("content-type", "text/plain; charset=utf-8"))
            }
        }
    }

    /// Handle a scheduled tick
    #[instrument(skip_all, fields(cron = %event.cron))]
    pub async fn handle_scheduled(&self, env: &HostEnv, event: ScheduledEvent) -> Result<()> {
        let instance = self.instance(env).await?;
        let context = json!({"dispatch": DispatchKind::Scheduled.as_str(), "cron": event.cron});

        let outcome = guarded(async {
            self.app.scheduled(instance.bridge(), event).await?;
            Ok(GuestValue::Nil)
        })
        .await;
        self.finish(&instance, DispatchKind::Scheduled, outcome, context)
            .await
            .map(|_| ())
    }

    /// Handle a queue delivery.
    ///
    /// Every handle of the delivery is released when this returns, settled
    /// or not, and whether or not guest code failed.
    #[instrument(skip_all, fields(binding = %binding))]
    pub async fn handle_queue(
        &self,
        env: &HostEnv,
        batch: Arc<dyn NativeBatch>,
        binding: &str,
    ) -> Result<()> {
        let instance = self.instance(env).await?;
        let (delivery, guard) = instance.host_state().queues.prepare(binding, batch);
        let context = json!({
            "dispatch": DispatchKind::Queue.as_str(),
            "queue": delivery.queue,
            "batch": guard.batch_handle(),
        });

        let batch = QueueBatch::from_delivery(instance.bridge().clone(), delivery);
        let outcome = guarded(async {
            self.app.queue(instance.bridge(), batch).await?;
            Ok(GuestValue::Nil)
        })
        .await;
        drop(guard);

        self.finish(&instance, DispatchKind::Queue, outcome, context)
            .await
            .map(|_| ())
    }

    /// Allocate (or return) the long-lived handle for an actor identity
    pub async fn open_actor(
        &self,
        env: &HostEnv,
        binding: &str,
        identity: &str,
        storage: Arc<dyn DurableStorage>,
    ) -> Result<Handle> {
        let instance = self.instance(env).await?;
        Ok(instance.open_actor(binding, identity, storage))
    }

    /// Release an actor handle and its cached guest instance
    pub fn evict_actor(&self, handle: &str) -> bool {
        self.booted()
            .map_or(false, |instance| instance.evict_actor(handle))
    }

    /// Dispatch a request to an actor
    #[instrument(skip_all, fields(binding = %binding, handle = %handle))]
    pub async fn handle_actor_fetch(
        &self,
        binding: &str,
        handle: &str,
        metadata: ActorMetadata,
        request: HostRequest,
        env: &HostEnv,
    ) -> Result<HostResponse> {
        let instance = self.instance(env).await?;
        let context = json!({
            "dispatch": DispatchKind::ActorFetch.as_str(),
            "binding": binding,
            "path": request.path,
        });

        let outcome = match self.activate(&instance, binding, handle, metadata) {
            Ok(actor) => guarded(async move { actor.fetch(request).await }).await,
            Err(error) => Err(error),
        };
        self.finish(&instance, DispatchKind::ActorFetch, outcome, context)
            .await
            .map(GuestValue::into_response)
    }

    /// Dispatch an actor's alarm
    #[instrument(skip_all, fields(binding = %binding, handle = %handle))]
    pub async fn handle_actor_alarm(
        &self,
        binding: &str,
        handle: &str,
        metadata: ActorMetadata,
        env: &HostEnv,
    ) -> Result<HostResponse> {
        let instance = self.instance(env).await?;
        let context = json!({"dispatch": DispatchKind::ActorAlarm.as_str(), "binding": binding});

        let outcome = match self.activate(&instance, binding, handle, metadata) {
            Ok(actor) => guarded(async move { actor.alarm().await }).await,
            Err(error) => Err(error),
        };
        self.finish(&instance, DispatchKind::ActorAlarm, outcome, context)
            .await
            .map(GuestValue::into_response)
    }

    fn activate(
        &self,
        instance: &GuestInstance,
        binding: &str,
        handle: &str,
        mut metadata: ActorMetadata,
    ) -> std::result::Result<Arc<ActorInstance>, BridgeError> {
        let opened_under = instance
            .host_state()
            .actors
            .with(handle, |slot| slot.binding.clone())?;
        if opened_under != binding {
            return Err(BridgeError::invalid_argument(format!(
                "Handle '{}' belongs to binding '{}', not '{}'",
                handle, opened_under, binding
            )));
        }
        metadata.binding = opened_under;
        instance.actors().activate(instance.bridge(), handle, metadata)
    }

    async fn finish(
        &self,
        instance: &GuestInstance,
        kind: DispatchKind,
        outcome: std::result::Result<GuestValue, BridgeError>,
        context: serde_json::Value,
    ) -> Result<GuestValue> {
        match outcome {
            Ok(value) => {
                self.metrics.record_dispatch(kind, true);
                Ok(value)
            }
            Err(error) => {
                self.fail(instance, kind, &error, context).await;
                Err(RuntimeError::Guest(error))
            }
        }
    }

    async fn fail(
        &self,
        instance: &GuestInstance,
        kind: DispatchKind,
        error: &BridgeError,
        context: serde_json::Value,
    ) {
        warn!(
            dispatch = kind.as_str(),
            code = %error.code,
            "Guest dispatch failed: {}",
            error.message
        );
        self.metrics.record_dispatch(kind, false);
        self.metrics.record_error(&error.code.to_string());
        instance.report(error, context).await;
    }

    /// Current counters; zeros before boot
    pub fn stats(&self) -> BridgeStats {
        match self.booted() {
            Some(instance) => instance.stats(),
            None => BridgeStats::default(),
        }
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Get Prometheus metrics
    pub fn prometheus_metrics(&self) -> String {
        self.metrics.to_prometheus()
    }
}

/// Run guest code, folding errors and panics into a [`BridgeError`]
async fn guarded<F>(work: F) -> std::result::Result<GuestValue, BridgeError>
where
    F: Future<Output = anyhow::Result<GuestValue>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BridgeError::from_guest(&e)),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            debug!(panic = %detail, "Guest code panicked");
            Err(BridgeError::guest(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryStorage;
    use crate::queue::{MemoryBatch, MemoryMessage, Settlement};

    struct App;

    #[async_trait]
    impl GuestApp for App {
        async fn fetch(&self, bridge: &HostBridge, request: HostRequest) -> anyhow::Result<GuestValue> {
            match request.path.as_str() {
                "/boom" => anyhow::bail!("secret detail"),
                "/panic" => panic!("guest panicked"),
                "/var" => Ok(GuestValue::from(bridge.var("APP_NAME").unwrap_or("?"))),
                _ => Ok(GuestValue::Nil),
            }
        }

        async fn queue(&self, _bridge: &HostBridge, batch: QueueBatch) -> anyhow::Result<()> {
            batch.messages[0].ack().await?;
            Ok(())
        }
    }

    struct Counter;

    #[async_trait]
    impl GuestActor for Counter {
        async fn fetch(&self, ctx: &ActorContext, _request: HostRequest) -> anyhow::Result<GuestValue> {
            let n = ctx
                .storage()
                .get("n")
                .await?
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                + 1;
            ctx.storage().put("n", json!(n)).await?;
            Ok(GuestValue::from(json!({"n": n, "id": ctx.id()})))
        }
    }

    fn runtime() -> BridgeRuntime {
        BridgeRuntime::new(BridgeConfig::default(), Arc::new(App))
            .unwrap()
            .with_actor("COUNTER", |_ctx| Arc::new(Counter) as Arc<dyn GuestActor>)
    }

    #[tokio::test]
    async fn test_instance_is_memoized() {
        let runtime = runtime();
        assert!(runtime.booted().is_none());
        let env = HostEnv::new().with_var("APP_NAME", "first");
        let a = runtime.instance(&env).await.unwrap();
        let b = runtime
            .instance(&HostEnv::new().with_var("APP_NAME", "second"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let response = runtime
            .handle_request(&HostEnv::new(), HostRequest::new("GET", "/var"))
            .await
            .unwrap();
        assert_eq!(response.body, "first");
    }

    #[tokio::test]
    async fn test_guest_error_is_masked_500() {
        let runtime = runtime();
        let response = runtime
            .handle_request(&HostEnv::new(), HostRequest::new("GET", "/boom"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Internal Server Error");

        let response = runtime
            .handle_request(&HostEnv::new(), HostRequest::new("GET", "/panic"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(runtime.metrics().failed_dispatches(), 2);
    }

    #[tokio::test]
    async fn test_guest_error_exposed_in_development() {
        let runtime = runtime();
        let env = HostEnv::new().with_var("ENVIRONMENT", "development");
        let response = runtime
            .handle_request(&env, HostRequest::new("GET", "/boom"))
            .await
            .unwrap();
        assert_eq!(response.body, "secret detail");
    }

    #[tokio::test]
    async fn test_queue_handles_released_after_dispatch() {
        let runtime = runtime();
        let messages = vec![
            Arc::new(MemoryMessage::new("m1", json!("a"))),
            Arc::new(MemoryMessage::new("m2", json!("b"))),
        ];
        let batch = Arc::new(MemoryBatch::new("jobs", messages.clone()));

        runtime
            .handle_queue(&HostEnv::new(), batch, "JOBS")
            .await
            .unwrap();

        assert_eq!(messages[0].settlements(), vec![Settlement::Acked]);
        assert!(messages[1].settlements().is_empty());
        assert_eq!(runtime.stats().live_queue_handles, 0);
    }

    #[tokio::test]
    async fn test_actor_fetch_keeps_state_and_refreshes_metadata() {
        let runtime = runtime();
        let env = HostEnv::new();
        let handle = runtime
            .open_actor(&env, "COUNTER", "room-1", Arc::new(MemoryStorage::new()))
            .await
            .unwrap();

        for (i, id) in [(1, "a"), (2, "b")] {
            let response = runtime
                .handle_actor_fetch(
                    "COUNTER",
                    &handle,
                    ActorMetadata::new("COUNTER").with_id(id),
                    HostRequest::new("POST", "/"),
                    &env,
                )
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
            assert_eq!(body, json!({"n": i, "id": id}));
        }
    }

    #[tokio::test]
    async fn test_actor_alarm_default_and_evicted_handle() {
        let runtime = runtime();
        let env = HostEnv::new();
        let handle = runtime
            .open_actor(&env, "COUNTER", "room-2", Arc::new(MemoryStorage::new()))
            .await
            .unwrap();

        let response = runtime
            .handle_actor_alarm("COUNTER", &handle, ActorMetadata::default(), &env)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());

        assert!(runtime.evict_actor(&handle));
        let err = runtime
            .handle_actor_alarm("COUNTER", &handle, ActorMetadata::default(), &env)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Guest(e) if e.code == crate::error::ErrorCode::HandleNotActive
        ));
    }

    #[tokio::test]
    async fn test_actor_dispatch_rejects_foreign_binding() {
        let runtime = runtime();
        let env = HostEnv::new();
        let handle = runtime
            .open_actor(&env, "COUNTER", "room-3", Arc::new(MemoryStorage::new()))
            .await
            .unwrap();

        let err = runtime
            .handle_actor_fetch(
                "ROOMS",
                &handle,
                ActorMetadata::default(),
                HostRequest::new("GET", "/"),
                &env,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Guest(e) if e.code == crate::error::ErrorCode::InvalidArgument
        ));
        assert!(!runtime.booted().unwrap().actors().contains(&handle));

        let err = runtime
            .handle_actor_alarm("COUNTER", "", ActorMetadata::default(), &env)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Guest(e) if e.code == crate::error::ErrorCode::HandleMalformed
        ));
    }

    #[tokio::test]
    async fn test_scheduled_default_is_ok() {
        let runtime = runtime();
        runtime
            .handle_scheduled(&HostEnv::new(), ScheduledEvent::now("*/5 * * * *"))
            .await
            .unwrap();
        assert_eq!(runtime.stats().total_dispatches, 1);
    }
}
