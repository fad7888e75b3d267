//! Authentication middleware for axum
//!
//! Every route in the table carries an [`Access`] predicate. Entitled routes
//! authenticate the caller and ask the [`Authorizer`]; secret routes are
//! authenticated by the operation secret inside the handler.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::common::auth::{AuthResult, Authorizer, Entitlement, Identity, KeyStore};
use crate::common::Error;

/// Access predicate attached to a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No authentication at all
    Public,
    /// Authenticated by an operation secret in the query string
    Secret,
    /// Authenticated caller holding the entitlement on the request URL
    Entitled(Entitlement),
}

/// Extension type for passing the caller identity to handlers
#[derive(Clone, Debug)]
pub struct AuthExtension(pub Identity);

/// State for auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub enabled: bool,
    pub key_store: Arc<KeyStore>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Resolve the caller of a request
pub fn authenticate(state: &AuthState, request: &Request<Body>) -> Result<Identity, Error> {
    if !state.enabled {
        return Ok(Identity::unauthenticated());
    }

    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let api_key_header = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());

    let result = if let Some(header) = auth_header {
        state.key_store.authenticate(header)
    } else if let Some(key) = api_key_header {
        state.key_store.validate_key(key)
    } else {
        AuthResult::Missing
    };

    match result {
        AuthResult::Ok(identity) => Ok(identity),
        AuthResult::Missing => Err(Error::Unauthorized("Authentication required".into())),
        AuthResult::Invalid(msg) => Err(Error::Unauthorized(format!("Invalid credentials: {}", msg))),
    }
}

/// Enforce a route's access predicate
pub async fn access_middleware(
    State((state, access)): State<(AuthState, Access)>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let entitlement = match access {
        Access::Public | Access::Secret => return next.run(request).await,
        Access::Entitled(entitlement) => entitlement,
    };

    let identity = match authenticate(&state, &request) {
        Ok(identity) => identity,
        Err(e) => return crate::api::response::error_response(&e).into_response(),
    };

    if let Err(e) =
        state
            .authorizer
            .check_permission(&identity, request.uri().path(), entitlement)
    {
        tracing::warn!(caller = %identity.name, path = %request.uri().path(), "Permission denied");
        return crate::api::response::error_response(&e).into_response();
    }

    request.extensions_mut().insert(AuthExtension(identity));
    next.run(request).await
}
