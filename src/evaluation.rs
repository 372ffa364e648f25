//! Script evaluation results and their one-shot completions.

use crate::error::ScriptError;
use crate::liveness::Liveness;
use serde_json::Value;

pub type EvalResult = Result<Value, ScriptError>;

/// Callback passed to `WebView::evaluate`.
pub type CompletionHandler = Box<dyn FnOnce(EvalResult) + 'static>;

/// An evaluation awaiting the engine's answer. Consumed when it fires.
pub struct Completion {
    handler: CompletionHandler,
    liveness: Liveness,
}

impl Completion {
    pub fn new(handler: CompletionHandler, liveness: Liveness) -> Self {
        Self { handler, liveness }
    }

    /// Runs the handler unless the owning view was torn down in the meantime.
    pub fn complete(self, result: EvalResult) {
        if self.liveness.is_deleted() {
            log::debug!("dropping script completion for a torn down view");
            return;
        }
        (self.handler)(result);
    }

    /// Decodes the engine's raw answer and completes with it.
    pub fn finish(self, native_error: Option<String>, json: Option<&str>) {
        self.complete(decode_result(native_error, json));
    }

    /// Completes from an engine that hands back a value object first and
    /// serialises it separately. See `decode_value`.
    pub fn finish_value(self, value: Option<Option<String>>) {
        self.complete(decode_value(value));
    }
}

/// Turns an engine answer into a value. A native error wins over any value;
/// missing or blank JSON (an `undefined` result) decodes to `null`.
pub fn decode_result(native_error: Option<String>, json: Option<&str>) -> EvalResult {
    if let Some(message) = native_error.filter(|message| !message.is_empty()) {
        return Err(ScriptError::new(message));
    }
    let text = match json.map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => return Ok(Value::Null),
    };
    serde_json::from_str(text).map_err(|err| ScriptError::new(err.to_string()))
}

/// `None` means the engine produced no value object at all, which is an
/// error. `Some(None)` is a value without a JSON form (`undefined`) and
/// decodes to `null`.
pub fn decode_value(value: Option<Option<String>>) -> EvalResult {
    match value {
        Some(json) => decode_result(None, json.as_deref()),
        None => Err(ScriptError::new("Failed to fetch result")),
    }
}
