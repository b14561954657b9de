//! Per-principal rate and concurrency gate in front of the API routes.
//!
//! Callers are identified by their tenant header when present, otherwise by
//! client address. The in-flight slot is held until the response is fully
//! produced; for event streams that means until the stream ends or the
//! client goes away.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use quarry_core::ratelimit::{InFlightGuard, Principal};

use crate::infra::{app_state::AppState, errors::AppError, tenant::tenant_from_headers};

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let limiter = state.governor.limiter();
    if !limiter.is_enabled() {
        return next.run(req).await;
    }

    let principal = principal_for(&req, state.config.security.trust_proxy_headers);
    let bucket = limiter.classify(req.uri().path());

    let guard = match limiter.admit(&principal, bucket) {
        Ok(guard) => guard,
        Err(err) => return AppError::from(err).into_response(),
    };

    let response = next.run(req).await;
    if is_event_stream(&response) {
        hold_until_body_ends(response, guard)
    } else {
        response
    }
}

fn principal_for(req: &Request, trust_proxy_headers: bool) -> Principal {
    if let Some(Ok(tenant)) = tenant_from_headers(req.headers()) {
        return Principal::Tenant(tenant);
    }

    if trust_proxy_headers && let Some(addr) = forwarded_addr(req.headers()) {
        return Principal::Address(addr);
    }

    let addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Principal::Address(addr)
}

/// Left-most `X-Forwarded-For` entry, falling back to `X-Real-IP`.
fn forwarded_addr(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

fn hold_until_body_ends(response: Response, guard: InFlightGuard) -> Response {
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn request(headers: &[(&'static str, &'static str)]) -> Request {
        let mut req = Request::new(Body::empty());
        for (name, value) in headers {
            req.headers_mut()
                .insert(*name, HeaderValue::from_static(value));
        }
        req
    }

    #[test]
    fn tenant_header_wins() {
        let req = request(&[("x-tenant-id", "u1"), ("x-forwarded-for", "203.0.113.9")]);
        assert_eq!(principal_for(&req, true).to_string(), "tenant:u1");
    }

    #[test]
    fn forwarded_address_needs_trust() {
        let req = request(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(principal_for(&req, true).to_string(), "ip:203.0.113.9");
        assert_eq!(principal_for(&req, false).to_string(), "ip:0.0.0.0");
    }

    #[test]
    fn connect_info_identifies_anonymous_callers() {
        let mut req = request(&[]);
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 5555))));
        assert_eq!(principal_for(&req, false).to_string(), "ip:192.0.2.4");
    }

    #[test]
    fn invalid_tenant_header_falls_back_to_address() {
        let req = request(&[("x-tenant-id", "../etc")]);
        assert_eq!(principal_for(&req, false).to_string(), "ip:0.0.0.0");
    }
}
