//! Shared application state for Axum handlers.
//!
//! Cloned per request; everything inside is behind an `Arc` or is itself a
//! cheap handle. The rate limiters live here rather than in the router so
//! every route under one stack counts against the same buckets, and tests
//! can build a state with fresh limiters.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::ErrorTranslator;
use crate::middleware::{CorsPolicy, FixedWindowLimiter, PipelineSettings, RateLimiter};
use crate::query::custom::CustomQueryLimits;
use crate::query::{CustomQueryGateway, QueryCatalog, QueryExecutor};
use crate::store::{DocumentStore, IndexManager};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub indexes: Arc<dyn IndexManager>,
    pub executor: QueryExecutor,
    pub gateway: CustomQueryGateway,
    pub api_limiter: Arc<dyn RateLimiter>,
    pub custom_query_limiter: Arc<dyn RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    /// Build state over a store that also manages its own indexes.
    pub fn new<S>(config: Config, store: Arc<S>) -> Self
    where
        S: DocumentStore + IndexManager + 'static,
    {
        let api_limiter: Arc<dyn RateLimiter> =
            Arc::new(FixedWindowLimiter::new("api", config.api_rate_limit));
        let custom_query_limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(
            "custom_query",
            config.custom_query_rate_limit,
        ));
        Self::with_limiters(config, store, api_limiter, custom_query_limiter)
    }

    pub fn with_limiters<S>(
        config: Config,
        store: Arc<S>,
        api_limiter: Arc<dyn RateLimiter>,
        custom_query_limiter: Arc<dyn RateLimiter>,
    ) -> Self
    where
        S: DocumentStore + IndexManager + 'static,
    {
        let documents: Arc<dyn DocumentStore> = store.clone();
        let indexes: Arc<dyn IndexManager> = store;

        let executor = QueryExecutor::new(
            Arc::new(QueryCatalog::standard()),
            documents.clone(),
            config.query_timeout,
        );
        let gateway = CustomQueryGateway::new(
            documents.clone(),
            CustomQueryLimits {
                default_limit: u64::from(config.custom_query_default_limit),
                max_limit: u64::from(config.custom_query_max_limit),
            },
            config.query_timeout,
        );

        Self {
            config: Arc::new(config),
            store: documents,
            indexes,
            executor,
            gateway,
            api_limiter,
            custom_query_limiter,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn translator(&self) -> ErrorTranslator {
        ErrorTranslator::new(self.config.environment.is_development())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            translator: self.translator(),
            api_limiter: self.api_limiter.clone(),
            custom_query_limiter: self.custom_query_limiter.clone(),
            strict_cors: CorsPolicy::strict(self.config.cors_allowed_origins.clone()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::store::MemoryStore;

    #[test]
    fn test_translator_follows_environment() {
        let state = AppState::new(Config::default(), Arc::new(MemoryStore::new()));
        assert_eq!(
            state.translator().is_development(),
            state.config.environment.is_development()
        );

        let config = Config {
            environment: Environment::Production,
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(MemoryStore::new()));
        assert!(!state.translator().is_development());
    }

    #[test]
    fn test_gateway_uses_configured_limits() {
        let config = Config {
            custom_query_default_limit: 7,
            custom_query_max_limit: 9,
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(MemoryStore::new()));
        assert_eq!(state.gateway.limits().default_limit, 7);
        assert_eq!(state.gateway.limits().max_limit, 9);
    }
}
