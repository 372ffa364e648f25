//! Native functions exposed to the page as `window.NAME(...)`.

use crate::error::BindingError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A bound native function. Receives the call's positional arguments.
pub type BindingCallback = Rc<dyn Fn(&[Value]) -> Result<Value, BindingError> + 'static>;

const SHIM_TEMPLATE: &str = r#"(function() {
const fnBinding = window._fnBindings = (window._fnBindings || { messageID: 1 });

window[FUNCTION_NAME] = function()
{
  const messageID = ++fnBinding.messageID;
  const promise = new Promise((resolve, reject) => { fnBinding[messageID] = { resolve, reject }; });

  const args = JSON.stringify ({ id: messageID,
                                 fn: FUNCTION_NAME,
                                 params: Array.prototype.slice.call (arguments)
                               },
                               (key, value) => typeof value === 'bigint' ? value.toString() : value);
  POST_MESSAGE (args);
  return promise;
}
})()"#;

#[derive(Default)]
pub struct BindingRegistry {
    functions: HashMap<String, BindingCallback>,
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing binding was replaced.
    pub fn insert(&mut self, name: &str, callback: BindingCallback) -> bool {
        self.functions.insert(name.to_string(), callback).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<BindingCallback> {
        self.functions.remove(name)
    }

    /// A handle to the callback, so the caller can invoke it without holding
    /// a borrow of the registry.
    pub fn get(&self, name: &str) -> Option<BindingCallback> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }
}

/// Script defining `window[name]` as a promise-returning proxy that posts
/// `{id, fn, params}` through `post_message_fn`.
pub fn shim_script(name: &str, post_message_fn: &str) -> String {
    SHIM_TEMPLATE
        .replace("POST_MESSAGE", post_message_fn)
        .replace("FUNCTION_NAME", &js_string(name))
}

pub fn unbind_script(name: &str) -> String {
    format!("delete window[{}];", js_string(name))
}

/// `text` as a quoted, escaped JS string literal.
pub fn js_string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}
