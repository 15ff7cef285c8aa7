//! Application state

use std::sync::Arc;

use axum::extract::FromRef;
use reelhub_billing::{BillingService, BillingStore, InMemoryStore, PgBillingStore};
use reelhub_shared::{create_pool, run_migrations};

use crate::{
    auth::AuthState,
    config::{Config, StoreBackend},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(config: Config, billing: Arc<BillingService>) -> Self {
        let auth = AuthState::new(&config.jwt_secret);
        Self {
            config,
            billing,
            auth,
        }
    }

    /// Open the configured store and wire the billing service from the environment
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn BillingStore> = match config.store_backend {
            StoreBackend::Postgres => {
                let database_url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
                tracing::info!("Connecting to database...");
                let pool = create_pool(database_url).await?;
                run_migrations(&pool).await?;
                tracing::info!("Database connection established");
                Arc::new(PgBillingStore::new(pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory billing store; state is lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let billing = BillingService::from_env(store, config.payment_provider)?;
        tracing::info!(
            provider = %config.payment_provider,
            "Billing service initialized"
        );
        Ok(Self::new(config, Arc::new(billing)))
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
