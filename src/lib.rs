//! Embeddable native web view with a promise-based bridge between page
//! JavaScript and Rust.
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use webbridge::{Options, Resource, WebView};
//!
//! let view = WebView::new(Options::default().with_resources(|path| match path {
//!     "/" => Some(Resource::new("<script>add(1, 2).then(console.log)</script>", "text/html")),
//!     _ => None,
//! }));
//! assert!(view.loaded_ok());
//!
//! view.bind("add", |args: &[Value]| {
//!     let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
//!     Ok(json!(sum))
//! })
//! .unwrap();
//! ```

pub mod binding;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod keys;
pub mod liveness;
pub mod options;
pub mod protocol;
pub mod resource;
mod view;

pub use engine::{Engine, EngineHooks, HeadlessEngine, PlatformEngine};
pub use error::{BindingError, EngineError, ScriptError, ViewError};
pub use evaluation::EvalResult;
pub use keys::KeyListener;
pub use options::Options;
pub use resource::{FetchOutcome, Resource, ResourceResponse};
pub use view::{ViewState, WebView};
