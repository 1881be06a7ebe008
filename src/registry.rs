//! Process-wide cache of concrete tenant models.
//!
//! Keyed by (declaration, tenant). Each tenant has a gate: synthesis for the
//! tenant is serialized behind its mutex, and teardown takes the write side
//! of its lock so no synthesis can run while the tenant is being deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use metrics::counter;
use sea_orm::DatabaseConnection;
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::concrete::ConcreteModel;
use crate::error::{ConfigurationError, TenancyError};
use crate::events::EventBus;
use crate::naming::Naming;
use crate::schema::{ModelCatalog, ModelKey};
use crate::synthesizer::Synthesizer;

#[derive(Default)]
struct TenantGate {
    teardown: Arc<AsyncRwLock<()>>,
    synthesis: AsyncMutex<()>,
}

#[derive(Default)]
struct RegistryState {
    models: HashMap<(ModelKey, Uuid), Arc<ConcreteModel>>,
    tables: HashMap<String, Arc<ConcreteModel>>,
}

pub struct ModelRegistry {
    db: DatabaseConnection,
    synthesizer: Synthesizer,
    state: RwLock<RegistryState>,
    gates: Mutex<HashMap<Uuid, Arc<TenantGate>>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ModelRegistry")
            .field("models", &state.models.len())
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    pub fn new(db: DatabaseConnection, synthesizer: Synthesizer) -> Self {
        Self {
            db,
            synthesizer,
            state: RwLock::new(RegistryState::default()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        self.synthesizer.catalog()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.synthesizer.events()
    }

    pub fn naming(&self) -> &Naming {
        self.synthesizer.naming()
    }

    /// Cached concrete model, without synthesizing.
    pub fn get(&self, declaration: &ModelKey, tenant_id: Uuid) -> Option<Arc<ConcreteModel>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .get(&(declaration.clone(), tenant_id))
            .cloned()
    }

    /// Returns the tenant's concrete model, synthesizing it on first request.
    ///
    /// Concurrent first requests for the same tenant synthesize once; every
    /// caller receives the same `Arc`.
    #[instrument(skip(self, declaration), fields(declaration = %declaration))]
    pub async fn get_or_create(
        &self,
        declaration: &ModelKey,
        tenant_id: Uuid,
    ) -> Result<Arc<ConcreteModel>, TenancyError> {
        if !self.catalog().is_tenant_model(declaration) {
            return Err(ConfigurationError::NotTenantAware {
                model: declaration.to_string(),
            }
            .into());
        }

        if let Some(model) = self.get(declaration, tenant_id) {
            counter!("tenancy_registry_cache_hits_total").increment(1);
            return Ok(model);
        }

        let gate = self.gate(tenant_id);
        let _teardown = gate.teardown.read().await;
        let _synthesis = gate.synthesis.lock().await;

        // Someone else may have finished while we waited.
        if let Some(model) = self.get(declaration, tenant_id) {
            counter!("tenancy_registry_cache_hits_total").increment(1);
            return Ok(model);
        }

        let existing: HashMap<ModelKey, Arc<ConcreteModel>> = self
            .cached_for_tenant(tenant_id)
            .into_iter()
            .map(|model| (model.declaration().clone(), model))
            .collect();

        let synthesized = self
            .synthesizer
            .synthesize(&self.db, declaration, tenant_id, &existing)
            .await?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for model in synthesized.fresh {
            state
                .tables
                .insert(model.table_name().to_string(), model.clone());
            state
                .models
                .insert((model.declaration().clone(), tenant_id), model);
        }
        Ok(synthesized.model)
    }

    /// Reverse lookup by table name.
    pub fn model_for_table(&self, table: &str) -> Option<Arc<ConcreteModel>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tables
            .get(table)
            .cloned()
    }

    pub fn cached_for_tenant(&self, tenant_id: Uuid) -> Vec<Arc<ConcreteModel>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .iter()
            .filter(|((_, tenant), _)| *tenant == tenant_id)
            .map(|(_, model)| model.clone())
            .collect()
    }

    /// Blocks new synthesis for the tenant until the guard is dropped.
    pub async fn lock_tenant(&self, tenant_id: Uuid) -> OwnedRwLockWriteGuard<()> {
        self.gate(tenant_id).teardown.clone().write_owned().await
    }

    /// Forgets every concrete model of the tenant and unbinds them as event senders.
    pub fn evict_tenant(&self, tenant_id: Uuid) -> usize {
        let evicted: Vec<Arc<ConcreteModel>> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<(ModelKey, Uuid)> = state
                .models
                .keys()
                .filter(|(_, tenant)| *tenant == tenant_id)
                .cloned()
                .collect();
            let evicted: Vec<Arc<ConcreteModel>> = keys
                .iter()
                .filter_map(|key| state.models.remove(key))
                .collect();
            for model in &evicted {
                state.tables.remove(model.table_name());
            }
            evicted
        };

        for model in &evicted {
            self.events().unbind(&model.schema_id());
        }
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);

        debug!(%tenant_id, evicted = evicted.len(), "evicted tenant models");
        evicted.len()
    }

    fn gate(&self, tenant_id: Uuid) -> Arc<TenantGate> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant_id)
            .or_default()
            .clone()
    }
}
