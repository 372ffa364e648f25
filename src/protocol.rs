//! Wire format between the page shims and the binding registry.
//!
//! A shim call arrives as `{"id": N, "fn": "name", "params": [...]}` and is
//! answered by evaluating a script that settles `window._fnBindings[N]`.
//! Anything that does not match that shape is dropped without an answer.

use crate::binding::BindingCallback;
use crate::error::BindingError;
use serde::Deserialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    pub id: u64,
    #[serde(rename = "fn")]
    pub function: String,
    pub params: Vec<Value>,
}

impl InboundMessage {
    /// `None` for unparsable input and for the reserved id 0.
    pub fn parse(raw: &str) -> Option<Self> {
        let message: Self = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("dropping malformed bridge message: {err}");
                return None;
            }
        };
        if message.id == 0 {
            log::debug!("dropping bridge message for {} with id 0", message.function);
            return None;
        }
        Some(message)
    }
}

/// How a pending page promise is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Resolve { id: u64, value: Value },
    Reject { id: u64 },
}

impl Settlement {
    pub fn from_outcome(id: u64, outcome: Result<Value, BindingError>) -> Self {
        match outcome {
            Ok(value) => Self::Resolve { id, value },
            Err(err) => {
                log::warn!("bound function failed for call {id}: {err}");
                Self::Reject { id }
            }
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Resolve { id, .. } | Self::Reject { id } => *id,
        }
    }

    /// Settles the promise, then drops its registry entry.
    pub fn script(&self) -> String {
        let item = format!("window._fnBindings[{}]", self.id());
        match self {
            Self::Resolve { value, .. } => format!("{item}.resolve({value}); delete {item};"),
            Self::Reject { .. } => format!("{item}.reject(); delete {item};"),
        }
    }
}

/// Runs a bound function, treating a panic as an ordinary failure.
pub fn run_callback(callback: &BindingCallback, params: &[Value]) -> Result<Value, BindingError> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(params))) {
        Ok(outcome) => outcome,
        Err(_) => Err(BindingError::new("bound function panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn parses_shim_message() {
        let message = InboundMessage::parse(r#"{"id":2,"fn":"add","params":[1,"2",null]}"#).unwrap();
        assert_eq!(
            message,
            InboundMessage {
                id: 2,
                function: "add".into(),
                params: vec![json!(1), json!("2"), Value::Null],
            }
        );
    }

    #[test]
    fn rejects_other_shapes() {
        for raw in [
            "",
            "not json",
            "[1,2]",
            r#"{"id":0,"fn":"f","params":[]}"#,
            r#"{"id":-3,"fn":"f","params":[]}"#,
            r#"{"fn":"f","params":[]}"#,
            r#"{"id":4,"params":[]}"#,
            r#"{"id":4,"fn":"f","params":{"a":1}}"#,
            r#"{"id":"4","fn":"f","params":[]}"#,
        ] {
            assert_eq!(InboundMessage::parse(raw), None, "{raw}");
        }
    }

    #[test]
    fn resolve_script_embeds_json_value() {
        let settlement = Settlement::from_outcome(7, Ok(json!({"sum": 3, "tag": "a\"b"})));
        assert_eq!(
            settlement.script(),
            r#"window._fnBindings[7].resolve({"sum":3,"tag":"a\"b"}); delete window._fnBindings[7];"#
        );
    }

    #[test]
    fn failure_rejects_without_payload() {
        let settlement = Settlement::from_outcome(9, Err(BindingError::new("secret detail")));
        assert_eq!(settlement, Settlement::Reject { id: 9 });
        let script = settlement.script();
        assert_eq!(script, "window._fnBindings[9].reject(); delete window._fnBindings[9];");
        assert!(!script.contains("secret"));
    }

    #[test]
    fn panicking_callback_is_a_failure() {
        let callback: BindingCallback = Rc::new(|_: &[Value]| -> Result<Value, BindingError> {
            panic!("callback bug")
        });
        assert!(run_callback(&callback, &[]).is_err());
    }

    proptest! {
        #[test]
        fn nonzero_ids_round_trip(id in 1u64..=u64::from(u32::MAX), name in "[a-zA-Z_][a-zA-Z0-9_]{0,16}") {
            let raw = json!({"id": id, "fn": name, "params": [id]}).to_string();
            let message = InboundMessage::parse(&raw).unwrap();
            prop_assert_eq!(message.id, id);
            prop_assert_eq!(message.function, name);
            prop_assert_eq!(message.params, vec![json!(id)]);
        }
    }
}
