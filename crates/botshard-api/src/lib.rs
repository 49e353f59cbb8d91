//! botshard-api — REST API for botshard.
//!
//! Provides axum route handlers for the caller surface (assignment,
//! registration, status queries) and the operator surface (manual
//! injection, retry, cleanup, metrics, pools).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/assign` | Pick a channel for a new agent |
//! | GET | `/api/v1/channels` | List channels (`region`, `kind`, `status` filters) |
//! | GET | `/api/v1/channels/{name}/registrations` | List registrations (`status` filter) |
//! | POST | `/api/v1/channels/{name}/registrations` | Queue an agent registration |
//! | DELETE | `/api/v1/channels/{name}/agents` | Record that an agent left |
//! | GET | `/api/v1/registrations/{id}` | Registration status |
//! | GET | `/api/v1/queue` | Queue counts (`channel` filter) |
//! | POST | `/api/v1/admin/channels/{name}/inject` | Inject one batch now |
//! | POST | `/api/v1/admin/reconcile` | Run one reconciliation pass |
//! | POST | `/api/v1/admin/registrations/retry-failed` | Requeue retryable failures |
//! | POST | `/api/v1/admin/registrations/cleanup` | Delete old completed rows |
//! | POST | `/api/v1/admin/registrations/clear-stuck` | Force-fail all PROCESSING |
//! | GET | `/api/v1/admin/metrics` | Latest fleet snapshot |
//! | GET | `/api/v1/admin/pools` | List pools (`region` filter) |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use botshard_inject::InjectionPipeline;
use botshard_metrics::MetricsCollector;
use botshard_placement::{ChannelAssigner, PoolProvisioner};
use botshard_state::StateStore;
use botshard_tracker::RegistrationTracker;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub assigner: Arc<ChannelAssigner>,
    pub provisioner: Arc<PoolProvisioner>,
    pub pipeline: Arc<InjectionPipeline>,
    pub tracker: Arc<RegistrationTracker>,
    pub metrics: Arc<MetricsCollector>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/assign", post(handlers::assign_channel))
        .route("/channels", get(handlers::list_channels))
        .route(
            "/channels/{name}/registrations",
            get(handlers::list_registrations).post(handlers::register_agent),
        )
        .route("/channels/{name}/agents", delete(handlers::remove_agent))
        .route("/registrations/{id}", get(handlers::get_registration))
        .route("/queue", get(handlers::queue_status))
        .route("/admin/channels/{name}/inject", post(handlers::inject_channel))
        .route("/admin/reconcile", post(handlers::reconcile))
        .route("/admin/registrations/retry-failed", post(handlers::retry_failed))
        .route("/admin/registrations/cleanup", post(handlers::cleanup))
        .route("/admin/registrations/clear-stuck", post(handlers::clear_stuck))
        .route("/admin/metrics", get(handlers::fleet_metrics))
        .route("/admin/pools", get(handlers::list_pools))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
