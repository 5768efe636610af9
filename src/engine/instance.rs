//! Guest runtime instance.
//!
//! A [`GuestInstance`] is one booted guest runtime. It owns every registry
//! the bridge needs: the host function table, the handle tables, the
//! rewrite handler arena and the actor cache. Nothing is process-global, so
//! separate instances never share handles.

use crate::actor::{ActorCache, ActorFactory, ActorSlot};
use crate::bridge::{report_best_effort, HostBridge};
use crate::config::{BridgeConfig, ErrorMasking};
use crate::envelope::Masker;
use crate::error::{BridgeError, Result};
use crate::handles::{Handle, HandleTable};
use crate::host::{DurableStorage, HostEnv};
use crate::host_functions::{install, HostFunctionRegistry, HostState};
use crate::metrics::{BridgeMetrics, BridgeStats};
use crate::queue::QueueHandles;
use crate::rewrite::guest::{HandlerRegistry, RewriteDispatcher};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique instance ID
pub type InstanceId = String;

/// One booted guest runtime
pub struct GuestInstance {
    /// Unique instance ID
    id: InstanceId,
    /// Boot time
    created_at: Instant,
    /// Masking mode chosen at boot
    masking: ErrorMasking,
    /// Bound host functions
    registry: Arc<HostFunctionRegistry>,
    /// State captured by the host functions
    state: Arc<HostState>,
    /// Guest-side dispatch object
    bridge: HostBridge,
    /// Cached guest actors
    actors: ActorCache,
    /// Actor handles by `binding/identity`
    actor_handles: DashMap<String, Handle>,
}

impl GuestInstance {
    /// Boot a runtime over `env`.
    ///
    /// Host functions capture `env` here; it is never swapped afterwards.
    pub fn boot(
        config: &BridgeConfig,
        env: HostEnv,
        factories: HashMap<String, ActorFactory>,
        metrics: Arc<BridgeMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4().to_string();
        let masking = config.resolve_masking(env.vars());
        let handlers = Arc::new(HandlerRegistry::new(config.max_rewrite_handlers));
        let dispatcher = Arc::new(RewriteDispatcher::new(Arc::clone(&handlers)));
        let vars = env.vars().clone();

        let state = Arc::new(HostState {
            env,
            masker: Masker::new(masking, config.generic_error_message.clone()),
            actors: Arc::new(HandleTable::new()),
            queues: Arc::new(QueueHandles::new()),
            rewrite: Arc::clone(&dispatcher),
            fetch_timeout_ms: config.fetch_timeout_ms,
            metrics: Arc::clone(&metrics),
        });

        let registry = Arc::new(HostFunctionRegistry::new(metrics));
        install(&registry, Arc::clone(&state));
        dispatcher.attach(&registry);

        let bridge = HostBridge::new(Arc::clone(&registry), handlers, vars);

        info!(
            instance_id = %id,
            masking = ?masking,
            capabilities = registry.names().len(),
            actor_bindings = factories.len(),
            "Booted guest instance"
        );

        Ok(Self {
            id,
            created_at: Instant::now(),
            masking,
            registry,
            state,
            bridge,
            actors: ActorCache::with_factories(factories),
            actor_handles: DashMap::new(),
        })
    }

    /// Get the instance ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time since boot
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Masking mode in effect
    pub fn masking(&self) -> ErrorMasking {
        self.masking
    }

    /// Envelope masker
    pub fn masker(&self) -> &Masker {
        &self.state.masker
    }

    /// Guest-side dispatch object
    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    /// Bound host functions
    pub fn registry(&self) -> &Arc<HostFunctionRegistry> {
        &self.registry
    }

    /// Host state shared by the host functions
    pub fn host_state(&self) -> &Arc<HostState> {
        &self.state
    }

    /// Cached guest actors
    pub fn actors(&self) -> &ActorCache {
        &self.actors
    }

    /// Handle for `identity` of `binding`, allocated on first use
    pub fn open_actor(
        &self,
        binding: &str,
        identity: &str,
        storage: Arc<dyn DurableStorage>,
    ) -> Handle {
        let key = actor_key(binding, identity);
        self.actor_handles
            .entry(key)
            .or_insert_with(|| {
                let handle = self
                    .state
                    .actors
                    .insert("actor", ActorSlot::new(binding, identity, storage));
                debug!(handle = %handle, binding = %binding, identity = %identity, "Opened actor");
                handle
            })
            .clone()
    }

    /// Release an actor handle, its storage and its cached guest instance
    pub fn evict_actor(&self, handle: &str) -> bool {
        self.actors.evict(handle);
        match self.state.actors.release(handle) {
            Some(slot) => {
                self.actor_handles
                    .remove(&actor_key(&slot.binding, &slot.identity));
                debug!(handle = %handle, "Evicted actor");
                true
            }
            None => false,
        }
    }

    /// Report a guest failure without ever failing
    pub async fn report(&self, error: &BridgeError, context: Value) {
        report_best_effort(&self.registry, error, context).await;
    }

    /// Current counters and live handle counts
    pub fn stats(&self) -> BridgeStats {
        let metrics = &self.state.metrics;
        BridgeStats {
            total_dispatches: metrics.total_dispatches(),
            failed_dispatches: metrics.failed_dispatches(),
            total_host_calls: metrics.total_host_calls(),
            rewrite_events: metrics.rewrite_events(),
            live_actor_handles: self.state.actors.len(),
            live_queue_handles: self.state.queues.live_messages() + self.state.queues.live_batches(),
            live_rewrite_handlers: self.bridge.handlers().len(),
        }
    }
}

fn actor_key(binding: &str, identity: &str) -> String {
    format!("{}/{}", binding, identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostCapability;
    use crate::host::MemoryStorage;

    fn boot(env: HostEnv) -> GuestInstance {
        GuestInstance::boot(
            &BridgeConfig::default(),
            env,
            HashMap::new(),
            Arc::new(BridgeMetrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_boot_binds_every_capability() {
        let instance = boot(HostEnv::new());
        assert!(instance.registry().interop_enabled());
        for capability in HostCapability::ALL {
            assert!(instance.registry().is_registered(capability.as_str()));
        }
        assert!(!instance.id().is_empty());
    }

    #[test]
    fn test_masking_follows_environment() {
        assert_eq!(boot(HostEnv::new()).masking(), ErrorMasking::Production);
        let dev = boot(HostEnv::new().with_var("ENVIRONMENT", "development"));
        assert_eq!(dev.masking(), ErrorMasking::Development);
    }

    #[test]
    fn test_open_actor_is_stable_per_identity() {
        let instance = boot(HostEnv::new());
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let a = instance.open_actor("ROOMS", "lobby", Arc::clone(&storage));
        let b = instance.open_actor("ROOMS", "lobby", Arc::clone(&storage));
        let c = instance.open_actor("ROOMS", "hall", storage);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(instance.stats().live_actor_handles, 2);

        assert!(instance.evict_actor(&a));
        assert!(!instance.evict_actor(&a));
        assert_eq!(instance.stats().live_actor_handles, 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let one = boot(HostEnv::new());
        let two = boot(HostEnv::new());
        let handle = one.open_actor("ROOMS", "lobby", Arc::new(MemoryStorage::new()));
        assert!(one.host_state().actors.contains(&handle));
        assert!(!two.host_state().actors.contains(&handle));
    }
}
