//! Service wiring: store and broker selection, verifier key loading.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use companies_auth::{JwtValidator, KeyError, PublicKeyValidator};
use companies_events::{EventPublisher, InMemoryEventBus};
use companies_infra::event_bus::{RedisStreamsError, RedisStreamsPublisher};
use companies_infra::{
    CompanyService, CompanyStore, InMemoryCompanyStore, PostgresCompanyStore, ServicePolicy,
    StoreError,
};

use crate::config::{Config, ConfigError};

const DATABASE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the HTTP handlers need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub companies: CompanyService,
}

/// Handles on the in-memory backends, for dev and tests.
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub store: Arc<InMemoryCompanyStore>,
    pub bus: Arc<InMemoryEventBus>,
}

impl AppServices {
    pub fn new(companies: CompanyService) -> Self {
        Self { companies }
    }

    /// Wire the service against in-memory store and bus.
    pub fn in_memory(
        verifier: Arc<dyn JwtValidator>,
        policy: ServicePolicy,
    ) -> (Self, InMemoryBackends) {
        let store = Arc::new(InMemoryCompanyStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let companies = CompanyService::new(verifier, store.clone(), bus.clone(), policy);
        (Self::new(companies), InMemoryBackends { store, bus })
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("token verification key: {0}")]
    Key(#[from] KeyError),

    #[error("company store: {0}")]
    Store(#[from] StoreError),

    #[error("event broker: {0}")]
    Broker(#[from] RedisStreamsError),
}

/// Build services from validated configuration.
///
/// Falls back to in-memory backends when no database / Redis URL is configured.
pub async fn build_services(config: &Config) -> Result<AppServices, StartupError> {
    let pem = config.public_key_pem()?;
    let verifier: Arc<dyn JwtValidator> =
        Arc::new(PublicKeyValidator::from_pem(config.algorithm()?, &pem)?);

    let store: Arc<dyn CompanyStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresCompanyStore::connect(
                url,
                config.database_max_connections,
                DATABASE_ACQUIRE_TIMEOUT,
            )
            .await?;
            store.bootstrap_schema().await?;
            info!("using postgres company store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory company store");
            Arc::new(InMemoryCompanyStore::new())
        }
    };

    let publisher: Arc<dyn EventPublisher> = match &config.redis_url {
        Some(url) => {
            let mut publisher =
                RedisStreamsPublisher::connect(url, Some(config.stream_key.clone())).await?;
            if let Some(max_len) = config.stream_max_len {
                publisher = publisher.with_max_len(max_len);
            }
            publisher.ping().await?;
            info!(
                stream_key = %publisher.stream_key(),
                max_len = ?config.stream_max_len,
                "publishing change events to redis stream"
            );
            Arc::new(publisher)
        }
        None => {
            warn!("REDIS_URL not set; change events stay in process");
            Arc::new(InMemoryEventBus::new())
        }
    };

    Ok(AppServices::new(CompanyService::new(
        verifier,
        store,
        publisher,
        config.policy(),
    )))
}
