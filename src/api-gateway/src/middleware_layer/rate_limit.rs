//! Per-client rate limiting middleware

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::{
    error::{GatewayError, Result},
    middleware_layer::trace::extract_client_ip,
    services::rate_limiter::RateDecision,
    state::AppState,
};

/// Charge the request to its client address; answer 429 once the budget is spent
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return Ok(next.run(request).await);
    };

    let client_ip = extract_client_ip(&request);

    match limiter.check(&client_ip) {
        RateDecision::Allowed {
            remaining,
            reset_secs,
        } => {
            debug!(client_ip = %client_ip, remaining, "Rate limit check passed");

            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), limiter.limit(), remaining, reset_secs);
            Ok(response)
        }
        RateDecision::Limited { retry_after_secs } => {
            state.metrics.record_rate_limited();
            warn!(client_ip = %client_ip, retry_after_secs, "Rate limit exceeded");

            Err(GatewayError::RateLimited {
                limit: limiter.limit(),
                retry_after_secs,
            })
        }
    }
}

fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    headers.insert("ratelimit-limit", HeaderValue::from(limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("ratelimit-reset", HeaderValue::from(reset_secs));
}
