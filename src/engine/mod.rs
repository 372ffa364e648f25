//! Native browser engines behind one contract.
//!
//! Exactly one adapter is linked per target: WebKitGTK on Linux, WKWebView
//! on macOS and WebView2 on Windows when the `native` feature is on, the
//! in-process headless engine otherwise.

use crate::error::EngineError;
use crate::evaluation::Completion;
use crate::options::Options;
use crate::resource::ResourceServer;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;

mod headless;
#[cfg(all(feature = "native", target_os = "linux"))]
mod webkitgtk;
#[cfg(all(feature = "native", target_os = "macos"))]
mod wkwebview;
#[cfg(all(feature = "native", target_os = "windows"))]
mod webview2;

pub use headless::HeadlessEngine;

#[cfg(all(feature = "native", target_os = "linux"))]
pub type PlatformEngine = webkitgtk::WebKitGtkEngine;
#[cfg(all(feature = "native", target_os = "macos"))]
pub type PlatformEngine = wkwebview::WkWebViewEngine;
#[cfg(all(feature = "native", target_os = "windows"))]
pub type PlatformEngine = webview2::WebView2Engine;
#[cfg(not(all(
    feature = "native",
    any(target_os = "linux", target_os = "macos", target_os = "windows")
)))]
pub type PlatformEngine = HeadlessEngine;

/// Receives every string the page posts through the bridge.
pub type MessageHandler = Rc<dyn Fn(&str) + 'static>;

/// What a view hands its engine at creation time.
#[derive(Clone)]
pub struct EngineHooks {
    pub on_message: MessageHandler,
    /// Present when the application serves resources.
    pub resources: Option<ResourceServer>,
    /// Home URI, always ending in `/`.
    pub home_uri: String,
    pub scheme: String,
}

pub trait Engine: Sized + 'static {
    /// Script expression the page calls with a JSON string to reach native code.
    const POST_MESSAGE_FN: &'static str;

    /// Builds the native view and finishes any async handshake. An error
    /// leaves the owning view permanently unusable.
    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError>;

    fn view_handle(&self) -> Option<NonNull<c_void>>;
    fn navigate(&self, url: &str) -> Result<(), EngineError>;
    fn set_html(&self, html: &str) -> Result<(), EngineError>;
    /// Runs `script` at document start of every subsequent page load.
    fn add_init_script(&self, script: &str) -> Result<(), EngineError>;
    /// Submits `script`; `completion` fires later, at most once.
    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError>;

    /// Whether key events reach the native view. Only some engines care.
    fn set_accept_key_events(&self, _accept: bool) {}

    /// Detaches native handlers. Called once, at view teardown.
    fn shutdown(&self);
}

/// Runs a native callback body, keeping panics from unwinding into the
/// engine's C code.
pub(crate) fn catch_boundary<R>(what: &str, body: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => Some(result),
        Err(_) => {
            log::error!("panic in {what} handler contained at engine boundary");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_contains_panics() {
        assert_eq!(catch_boundary("test", || 5), Some(5));
        assert_eq!(catch_boundary("test", || -> u8 { panic!("engine bug") }), None);
    }

    #[cfg(not(feature = "native"))]
    #[test]
    fn default_build_runs_headless() {
        use std::any::TypeId;
        assert_eq!(TypeId::of::<PlatformEngine>(), TypeId::of::<HeadlessEngine>());
    }
}
