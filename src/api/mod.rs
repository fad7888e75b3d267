//! HTTP API
//!
//! Every endpoint is one row of the route table: method, path, access
//! predicate and handler. The router is assembled from the table, so the
//! access check cannot be forgotten on a single handler.

pub mod operations;
pub mod request;
pub mod response;
pub mod types;
pub mod volumes;

use crate::common::auth::Entitlement;
use crate::common::auth_middleware::{access_middleware, Access, AuthState};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::orchestrator::Orchestrator;
use axum::handler::Handler;
use axum::middleware;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub orch: Arc<Orchestrator>,
}

pub struct Route {
    pub method: MethodFilter,
    pub path: &'static str,
    pub access: Access,
    pub handler: MethodRouter<AppState>,
}

fn route<H, T>(method: MethodFilter, path: &'static str, access: Access, handler: H) -> Route
where
    H: Handler<T, AppState>,
    T: 'static,
{
    Route {
        method,
        path,
        access,
        handler: on(method, handler),
    }
}

const VOLUMES: &str = "/1.0/storage-pools/:pool/volumes";
const VOLUMES_OF_TYPE: &str = "/1.0/storage-pools/:pool/volumes/:type";
const VOLUME: &str = "/1.0/storage-pools/:pool/volumes/:type/:name";

pub fn routes() -> Vec<Route> {
    use Access::{Entitled, Public, Secret};
    use Entitlement::*;
    use MethodFilter as M;

    vec![
        route(M::GET, "/", Public, operations::server_info),
        route(M::GET, "/1.0", Public, operations::server_info),
        route(M::GET, VOLUMES, Entitled(CanView), volumes::list_volumes),
        route(M::POST, VOLUMES, Entitled(CanEdit), volumes::create_volume),
        route(M::GET, VOLUMES_OF_TYPE, Entitled(CanView), volumes::list_volumes_of_type),
        route(M::POST, VOLUMES_OF_TYPE, Entitled(CanEdit), volumes::create_volume_of_type),
        route(M::GET, VOLUME, Entitled(CanView), volumes::get_volume),
        route(M::PUT, VOLUME, Entitled(CanEdit), volumes::put_volume),
        route(M::PATCH, VOLUME, Entitled(CanEdit), volumes::patch_volume),
        route(M::POST, VOLUME, Entitled(CanEdit), volumes::post_volume),
        route(M::DELETE, VOLUME, Entitled(CanDelete), volumes::delete_volume),
        route(M::GET, "/1.0/operations", Entitled(CanView), operations::list_operations),
        route(M::GET, "/1.0/operations/:id", Entitled(CanView), operations::get_operation),
        route(
            M::DELETE,
            "/1.0/operations/:id",
            Entitled(CanManageOperations),
            operations::cancel_operation,
        ),
        route(M::GET, "/1.0/operations/:id/wait", Entitled(CanView), operations::wait_operation),
        route(M::GET, "/1.0/operations/:id/websocket", Secret, operations::operation_websocket),
    ]
}

/// Build the router from the route table
pub fn router(state: AppState, auth: AuthState, max_body_bytes: usize) -> Router {
    let mut router = Router::new();
    for route in routes() {
        tracing::debug!(method = ?route.method, path = route.path, access = ?route.access, "Registering route");
        let guard = middleware::from_fn_with_state((auth.clone(), route.access), access_middleware);
        router = router.route(route.path, route.handler.route_layer(guard));
    }
    router
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}
