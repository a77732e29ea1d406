//! Health/status HTTP endpoint (SPEC_FULL.md §10.5), in the shape of the
//! teacher's `http::start_http`: a tiny_http server on its own thread,
//! routed by method + path segments, no framework.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

use serde_json::json;
use tiny_http::{Header, Response, Server, StatusCode};

use crate::broker::Broker;
use crate::correlation::CorrelationEngine;
use crate::devlink::ConnectionState;
use crate::error::{BridgeError, Result};
use crate::resolver::AgentResolver;

pub struct HealthState<'s> {
    pub connection_state: Arc<std::sync::Mutex<ConnectionState>>,
    pub broker: &'s Broker,
    pub resolver: &'s AgentResolver<'s>,
    pub correlation: &'s CorrelationEngine<'s>,
}

/// Spawned via `thread::scope` (like every other component thread) so it
/// can borrow `Broker`/`AgentResolver`/`CorrelationEngine` for the
/// duration of the process instead of requiring `Arc<...>` everywhere.
pub fn start<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    bind_addr: &str,
    state: HealthState<'env>,
) -> Result<ScopedJoinHandle<'scope, ()>> {
    let server = Server::http(bind_addr)
        .map_err(|e| BridgeError::InvalidInput(format!("health bind error: {e}")))?;
    tracing::info!(bind_addr, "health endpoint started");

    Ok(scope.spawn(move || {
        for request in server.incoming_requests() {
            let (status, body) = route(&request, &state);
            let response = Response::from_data(body)
                .with_status_code(StatusCode(status))
                .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap());
            let _ = request.respond(response);
        }
    }))
}

fn route(request: &tiny_http::Request, state: &HealthState) -> (u16, Vec<u8>) {
    match request.url() {
        "/healthz" => (200, b"ok".to_vec()),
        "/status" => {
            let conn_state = format!("{:?}", *state.connection_state.lock().unwrap());
            let broker_stats = state.broker.stats();
            let resolver_stats = state.resolver.stats();
            let corr_stats = state.correlation.stats();

            let body = json!({
                "devlink3_connection_state": conn_state,
                "broker": {
                    "published": broker_stats.published.load(Ordering::Relaxed),
                    "dropped": broker_stats.dropped.load(Ordering::Relaxed),
                },
                "agent_resolver": {
                    "hits": resolver_stats.hits.load(Ordering::Relaxed),
                    "misses": resolver_stats.misses.load(Ordering::Relaxed),
                    "placeholders_created": resolver_stats.placeholders_created.load(Ordering::Relaxed),
                },
                "correlation": {
                    "devlink_events_received": corr_stats.devlink_events_received.load(Ordering::Relaxed),
                    "smdr_records_received": corr_stats.smdr_records_received.load(Ordering::Relaxed),
                    "matched_count": corr_stats.matched_count.load(Ordering::Relaxed),
                    "unmatched_count": corr_stats.unmatched_count.load(Ordering::Relaxed),
                    "avg_match_latency_ms": corr_stats.avg_match_latency_ms(),
                    "errors": corr_stats.errors.load(Ordering::Relaxed),
                },
            });
            (200, serde_json::to_vec(&body).unwrap_or_default())
        }
        _ => (404, b"{\"error\":\"not found\"}".to_vec()),
    }
}
