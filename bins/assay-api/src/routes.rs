use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/languages", get(handlers::languages))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
