//! Declared routes.
//!
//! Routes are registered once at startup. The durable chat route carries an
//! approval gate; the simple chat route goes straight to the model but
//! persists state exactly like every other exchange.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

use super::route::{Route, RouteBuilder};

/// Validate an incoming payload against the configured limits.
///
/// Shared by the REST layer (synchronous 400) and the `validate-input` step.
pub fn validate_payload(payload: &str, max_chars: usize) -> EngineResult<()> {
    if payload.trim().is_empty() {
        return Err(EngineError::BadInput("payload must not be empty".into()));
    }
    let length = payload.chars().count();
    if length > max_chars {
        return Err(EngineError::BadInput(format!(
            "payload length {length} exceeds the maximum of {max_chars} characters"
        )));
    }
    Ok(())
}

/// The canonical durable chat route:
/// `validate-input → log-request → before-approval → approval-gate →
///  after-approval → call-llm → process-response → update-metrics`.
pub fn chat_durable(config: &EngineConfig) -> Route {
    let max_chars = config.max_payload_chars;
    let timeout = Duration::from_secs_f64(config.approval_timeout_minutes * 60.0);

    RouteBuilder::new("chat-durable")
        .transform("validate-input", move |input| {
            validate_payload(input.body, max_chars)?;
            Ok(input.body.to_string())
        })
        .audit_log("log-request")
        .transform("before-approval", |input| Ok(input.body.to_string()))
        .approval_gate("approval-gate", timeout)
        .transform("after-approval", |input| Ok(input.body.to_string()))
        .llm_chat("call-llm", false)
        .transform("process-response", |input| {
            Ok(input.body.trim().to_string())
        })
        .metric_update("update-metrics")
        .build()
}

/// The simple chat route: no gate, streaming model call.
pub fn chat_simple(config: &EngineConfig) -> Route {
    let max_chars = config.max_payload_chars;

    RouteBuilder::new("chat-simple")
        .transform("validate-input", move |input| {
            validate_payload(input.body, max_chars)?;
            Ok(input.body.to_string())
        })
        .audit_log("log-request")
        .llm_chat("call-llm", true)
        .transform("process-response", |input| {
            Ok(input.body.trim().to_string())
        })
        .metric_update("update-metrics")
        .build()
}
