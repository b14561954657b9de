//! Tenant identity as established by the upstream authentication layer.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use quarry_core::TenantId;

use super::errors::AppError;

/// Header the authenticating proxy sets to the caller's opaque user key.
pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug, Clone)]
pub struct Tenant(pub TenantId);

/// `None` when the header is absent.
pub fn tenant_from_headers(
    headers: &HeaderMap,
) -> Option<Result<TenantId, AppError>> {
    let raw = headers.get(TENANT_HEADER)?;
    Some(
        raw.to_str()
            .map_err(|_| AppError::bad_request("tenant header is not valid text"))
            .and_then(|raw| TenantId::new(raw.trim()).map_err(AppError::from)),
    )
}

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        match tenant_from_headers(&parts.headers) {
            Some(tenant) => tenant.map(Self),
            None => Err(AppError::unauthorized("missing tenant identity")),
        }
    }
}
