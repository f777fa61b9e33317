//! Correlation-id propagation at the service boundary.
//!
//! The header name is already lowercase, so it works unchanged as an
//! HTTP/2 header field or a gRPC metadata key.

use std::collections::HashMap;

use trellis_core::{Context, CorrelationId};

/// Wire name of the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-tx-correlation-id";

/// Client side: copy the context's correlation id into an outgoing header
/// map. No-op without one.
pub fn inject(ctx: &Context, headers: &mut HashMap<String, String>) {
    if let Some(id) = ctx.correlation_id() {
        headers.insert(CORRELATION_ID_HEADER.to_string(), id.to_string());
    }
}

/// Server side: derive a context carrying the correlation id from incoming
/// headers. Returns the context unchanged when the header is absent.
pub fn extract(ctx: &Context, headers: &HashMap<String, String>) -> Context {
    match headers.get(CORRELATION_ID_HEADER) {
        Some(id) if !id.is_empty() => ctx.with_correlation_id(CorrelationId::from(id.as_str())),
        _ => ctx.clone(),
    }
}
