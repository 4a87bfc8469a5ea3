//! Scripted invokers for exercising the executor without a live LLM.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::invoker::{LlmInvoker, LlmResponse, TIMEOUT_MARKER};

/// Returns a fixed response for every invocation.
pub struct CannedInvoker {
    response: String,
}

impl CannedInvoker {
    pub fn new(response: impl Into<String>) -> Self {
        CannedInvoker { response: response.into() }
    }
}

impl LlmInvoker for CannedInvoker {
    fn invoke(&self, _prompt: &str, _model: &str, _timeout: Duration) -> LlmResponse {
        LlmResponse { text: self.response.clone(), latency_ms: 1 }
    }
}

/// Pops queued responses in order; an exhausted queue reports failure.
pub struct SequenceInvoker {
    responses: Mutex<VecDeque<String>>,
}

impl SequenceInvoker {
    pub fn new(responses: Vec<String>) -> Self {
        SequenceInvoker { responses: Mutex::new(responses.into()) }
    }
}

impl LlmInvoker for SequenceInvoker {
    fn invoke(&self, _prompt: &str, _model: &str, _timeout: Duration) -> LlmResponse {
        let mut queue = self.responses.lock().unwrap();
        let text = queue
            .pop_front()
            .unwrap_or_else(|| "ERROR: no scripted response left".to_string());
        LlmResponse { text, latency_ms: 1 }
    }
}

/// Simulates a worker that never returns: blocks for the full timeout
/// (capped so tests stay fast), then reports a timeout envelope.
pub struct NeverRespondsInvoker {
    /// Upper bound on the simulated block, keeping test wall-clock small
    pub max_block: Duration,
}

impl NeverRespondsInvoker {
    pub fn new(max_block: Duration) -> Self {
        NeverRespondsInvoker { max_block }
    }
}

impl LlmInvoker for NeverRespondsInvoker {
    fn invoke(&self, _prompt: &str, _model: &str, timeout: Duration) -> LlmResponse {
        let block = timeout.min(self.max_block);
        std::thread::sleep(block);
        LlmResponse {
            text: format!("{} after {:.0}s", TIMEOUT_MARKER, timeout.as_secs_f64()),
            latency_ms: block.as_millis() as u64,
        }
    }
}
