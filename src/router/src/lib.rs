use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use common::catalog::Catalog;
use common::config::Configuration;
use guard::{Guard, ProbeError, build_guard};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod endpoints;

pub trait RouterState: std::fmt::Debug + Clone + Send + Sync + 'static {
    fn catalog(&self) -> &Catalog;
    fn config(&self) -> &Configuration;
    fn guard(&self) -> &Guard;
}

/// RouterState holds any shared state that needs to be accessed by route handlers
#[derive(Clone)]
pub struct InMemoryStateImpl {
    catalog: Catalog,
    config: Configuration,
    guard: Arc<Guard>,
}

impl std::fmt::Debug for InMemoryStateImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStateImpl")
            .field("catalog", &self.catalog)
            .field("config", &"Configuration")
            .field("guard", &"Guard")
            .finish()
    }
}

impl InMemoryStateImpl {
    /// Wire the usage probe and bulk delete coordinator for the given catalog.
    pub fn new(catalog: Catalog, config: Configuration) -> Result<Self, ProbeError> {
        let guard = Arc::new(build_guard(&config, catalog.clone())?);
        Ok(Self {
            catalog,
            config,
            guard,
        })
    }
}

impl RouterState for InMemoryStateImpl {
    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn config(&self) -> &Configuration {
        &self.config
    }

    fn guard(&self) -> &Guard {
        &self.guard
    }
}

/// Create a new router instance with all routes configured
pub fn create_router<S: RouterState>(state: S) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", endpoints::entities::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the HTTP API on `listener` until `shutdown` resolves.
pub async fn serve<S: RouterState>(
    state: S,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

/// Basic health check endpoint
async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::TestConfigBuilder;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_signal() {
        let catalog = Catalog::new("sqlite::memory:").await.unwrap();
        let state = InMemoryStateImpl::new(catalog, TestConfigBuilder::new().build()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(state, listener, async move {
            rx.await.ok();
        }));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_peer_url_is_rejected() {
        let catalog = Catalog::new("sqlite::memory:").await.unwrap();
        let config = TestConfigBuilder::new().with_peer_url("not a url").build();
        assert!(InMemoryStateImpl::new(catalog, config).is_err());
    }
}
