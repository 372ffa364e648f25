use crate::binding::{self, BindingCallback, BindingRegistry};
use crate::engine::{Engine, EngineHooks, MessageHandler, PlatformEngine};
use crate::error::{BindingError, EngineError, ViewError};
use crate::evaluation::{Completion, EvalResult};
use crate::keys::{self, KeyListener, KeyListeners};
use crate::liveness::Liveness;
use crate::options::Options;
use crate::protocol::{self, InboundMessage, Settlement};
use crate::resource::ResourceServer;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Uninitialized,
    /// Waiting on the engine's creation handshake.
    Initializing,
    Ready,
    /// The engine could not be created. Behaves like `TornDown`.
    Failed,
    TornDown,
}

/// A native browser view with a function bridge into its page.
///
/// All methods must be called on the thread that created the view, which
/// must be running the platform's GUI event loop.
pub struct WebView<E: Engine = PlatformEngine> {
    core: Rc<Core<E>>,
}

struct Core<E: Engine> {
    engine: Option<E>,
    state: Cell<ViewState>,
    liveness: Liveness,
    bindings: RefCell<BindingRegistry>,
    keys: KeyListeners,
    home_uri: String,
}

impl WebView {
    /// Creates a view on the engine compiled in for this platform.
    ///
    /// Without the `native` feature that engine is `HeadlessEngine`: the
    /// view reports `loaded_ok()` but nothing is rendered and evaluations
    /// only complete when answered through the engine handle.
    pub fn new(options: Options) -> Self {
        WebView::create(options)
    }
}

impl Default for WebView {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<E: Engine> WebView<E> {
    /// Creates a view on a specific engine. Check `loaded_ok` before use.
    pub fn create(options: Options) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<Core<E>>| Core::start(&options, weak.clone()));
        let view = Self { core };
        if view.loaded_ok() {
            view.install_key_bindings();
            if options.fetch_resource.is_some() {
                if let Err(err) = view.navigate("") {
                    log::warn!("initial navigation to {} failed: {err}", view.core.home_uri);
                }
            }
        }
        view
    }

    pub fn loaded_ok(&self) -> bool {
        self.core.is_ready()
    }

    pub fn state(&self) -> ViewState {
        self.core.state.get()
    }

    /// Engine backing this view, while it is usable.
    pub fn engine(&self) -> Option<&E> {
        self.core.engine()
    }

    /// Opaque native handle for the host window to embed.
    pub fn view_handle(&self) -> Option<NonNull<c_void>> {
        self.core.engine().and_then(|engine| engine.view_handle())
    }

    /// URI navigated to when serving resources.
    pub fn home_uri(&self) -> &str {
        &self.core.home_uri
    }

    /// Loads `url`, or the home URI when `url` is empty.
    pub fn navigate(&self, url: &str) -> Result<(), ViewError> {
        let engine = self.core.ready_engine()?;
        let target = if url.is_empty() {
            self.core.home_uri.as_str()
        } else {
            url
        };
        log::debug!("navigating to {target}");
        engine.navigate(target)?;
        Ok(())
    }

    pub fn set_html(&self, html: &str) -> Result<(), ViewError> {
        self.core.ready_engine()?.set_html(html)?;
        Ok(())
    }

    pub fn add_init_script(&self, script: &str) -> Result<(), ViewError> {
        self.core.ready_engine()?.add_init_script(script)?;
        Ok(())
    }

    /// Runs `script` and discards its result.
    pub fn evaluate(&self, script: &str) -> Result<(), ViewError> {
        self.core.evaluate(script, None)
    }

    /// Runs `script` and hands its decoded result to `on_complete` later.
    /// `on_complete` never runs if the view is torn down first.
    pub fn evaluate_with<F>(&self, script: &str, on_complete: F) -> Result<(), ViewError>
    where
        F: FnOnce(EvalResult) + 'static,
    {
        self.core.evaluate(script, Some(Box::new(on_complete)))
    }

    /// Exposes `callback` to the page as `window[name]`, returning a promise.
    /// Replaces any earlier binding of the same name.
    ///
    /// An empty `name` is refused with an `invalid_request` engine error.
    /// If the engine rejects the page script the binding is not registered.
    pub fn bind<F>(&self, name: &str, callback: F) -> Result<(), ViewError>
    where
        F: Fn(&[Value]) -> Result<Value, BindingError> + 'static,
    {
        self.core.bind(name, Rc::new(callback))
    }

    pub fn unbind(&self, name: &str) -> Result<(), ViewError> {
        self.core.unbind(name)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.core.bindings.borrow().contains(name)
    }

    pub fn bound_names(&self) -> Vec<String> {
        self.core.bindings.borrow().names()
    }

    pub fn add_key_listener(&self, listener: Rc<dyn KeyListener>) {
        if self.core.is_ready() {
            self.core.keys.add(listener);
        }
    }

    pub fn remove_key_listener(&self, listener: &Rc<dyn KeyListener>) {
        self.core.keys.remove(listener);
    }

    /// Tears the view down. Pending completions and in-flight calls become
    /// no-ops; every later operation fails with `NotReady`.
    pub fn close(&mut self) {
        self.core.teardown();
    }

    fn install_key_bindings(&self) {
        let weak = Rc::downgrade(&self.core);
        let down = weak.clone();
        let up = weak.clone();
        let toggle = weak;

        let installed = [
            self.core.bind(
                keys::KEY_DOWN_BINDING,
                Rc::new(move |args: &[Value]| {
                    if let Some(core) = down.upgrade() {
                        core.keys.key_down(key_argument(args));
                    }
                    Ok::<_, BindingError>(Value::Null)
                }),
            ),
            self.core.bind(
                keys::KEY_UP_BINDING,
                Rc::new(move |args: &[Value]| {
                    if let Some(core) = up.upgrade() {
                        core.keys.key_up(key_argument(args));
                    }
                    Ok::<_, BindingError>(Value::Null)
                }),
            ),
            self.core.bind(
                keys::ENABLE_KEY_EVENTS_BINDING,
                Rc::new(move |args: &[Value]| {
                    let accept = args.first().and_then(Value::as_bool).unwrap_or(false);
                    if let Some(core) = toggle.upgrade() {
                        if let Some(engine) = core.engine() {
                            engine.set_accept_key_events(accept);
                        }
                    }
                    Ok::<_, BindingError>(Value::Null)
                }),
            ),
        ];
        for result in installed {
            if let Err(err) = result {
                log::warn!("failed to install key event bindings: {err}");
            }
        }
    }
}

impl<E: Engine> Drop for WebView<E> {
    fn drop(&mut self) {
        self.core.teardown();
    }
}

impl<E: Engine> Core<E> {
    fn start(options: &Options, weak: Weak<Self>) -> Self {
        let mut core = Self {
            engine: None,
            state: Cell::new(ViewState::Uninitialized),
            liveness: Liveness::new(),
            bindings: RefCell::new(BindingRegistry::new()),
            keys: KeyListeners::default(),
            home_uri: String::new(),
        };

        let (home_uri, scheme) = match options.home_uri().and_then(|home| Ok((home, options.uri_scheme()?))) {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("web view not created: {err}");
                core.state.set(ViewState::Failed);
                return core;
            }
        };
        core.home_uri = home_uri.clone();

        let on_message: MessageHandler = Rc::new(move |raw: &str| {
            if let Some(core) = weak.upgrade() {
                core.invoke_binding(raw);
            }
        });
        let resources = options.fetch_resource.clone().map(|resolver| {
            ResourceServer::new(resolver).with_user_agent(options.user_agent().map(str::to_string))
        });
        let hooks = EngineHooks {
            on_message,
            resources,
            home_uri,
            scheme,
        };

        core.state.set(ViewState::Initializing);
        match E::create(options, hooks) {
            Ok(engine) => {
                core.engine = Some(engine);
                core.state.set(ViewState::Ready);
            }
            Err(err) => {
                log::error!("browser engine failed to initialise: {err}");
                core.state.set(ViewState::Failed);
            }
        }
        core
    }

    fn is_ready(&self) -> bool {
        self.state.get() == ViewState::Ready && self.liveness.is_alive()
    }

    fn engine(&self) -> Option<&E> {
        if self.is_ready() {
            self.engine.as_ref()
        } else {
            None
        }
    }

    fn ready_engine(&self) -> Result<&E, ViewError> {
        self.engine().ok_or(ViewError::NotReady)
    }

    fn evaluate(&self, script: &str, on_complete: Option<Box<dyn FnOnce(EvalResult)>>) -> Result<(), ViewError> {
        let engine = self.ready_engine()?;
        let completion = on_complete.map(|handler| Completion::new(handler, self.liveness.clone()));
        engine.evaluate(script, completion)?;
        Ok(())
    }

    fn bind(&self, name: &str, callback: BindingCallback) -> Result<(), ViewError> {
        let engine = self.ready_engine()?;
        if name.is_empty() {
            return Err(ViewError::Engine(EngineError::new(
                "invalid_request",
                "binding name must not be empty",
            )));
        }
        let script = binding::shim_script(name, E::POST_MESSAGE_FN);
        engine.add_init_script(&script)?;
        engine.evaluate(&script, None)?;
        if self.bindings.borrow_mut().insert(name, callback) {
            log::debug!("replaced binding {name}");
        }
        Ok(())
    }

    fn unbind(&self, name: &str) -> Result<(), ViewError> {
        if self.bindings.borrow_mut().remove(name).is_none() {
            return Err(ViewError::NotBound(name.to_string()));
        }
        if let Some(engine) = self.engine() {
            if let Err(err) = engine.evaluate(&binding::unbind_script(name), None) {
                log::warn!("failed to remove window[{name:?}] from page: {err}");
            }
        }
        Ok(())
    }

    /// Handles one string posted by a page shim.
    fn invoke_binding(&self, raw: &str) {
        if !self.is_ready() {
            return;
        }
        let Some(message) = InboundMessage::parse(raw) else {
            return;
        };
        let Some(callback) = self.bindings.borrow().get(&message.function) else {
            log::debug!("dropping call {} to unbound function {}", message.id, message.function);
            return;
        };

        let liveness = self.liveness.clone();
        let outcome = protocol::run_callback(&callback, &message.params);
        // the callback may have torn the view down
        if liveness.is_deleted() {
            return;
        }

        let settlement = Settlement::from_outcome(message.id, outcome);
        if let Err(err) = self.evaluate(&settlement.script(), None) {
            log::warn!("failed to settle call {}: {err}", settlement.id());
        }
    }

    fn teardown(&self) {
        if self.liveness.is_deleted() {
            return;
        }
        self.liveness.mark_deleted();
        if let Some(engine) = &self.engine {
            engine.shutdown();
        }
        if self.state.get() != ViewState::Failed {
            self.state.set(ViewState::TornDown);
        }
        self.bindings.borrow_mut().clear();
        self.keys.clear();
        log::debug!("web view torn down");
    }
}

fn key_argument(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeadlessEngine;
    use serde_json::json;

    fn view() -> WebView<HeadlessEngine> {
        WebView::create(Options::default())
    }

    #[test]
    fn new_view_is_ready_with_key_bindings() {
        let view = view();
        assert!(view.loaded_ok());
        assert_eq!(view.state(), ViewState::Ready);
        assert!(view.view_handle().is_some());
        assert_eq!(
            view.bound_names(),
            vec![
                keys::ENABLE_KEY_EVENTS_BINDING,
                keys::KEY_DOWN_BINDING,
                keys::KEY_UP_BINDING
            ]
        );
    }

    #[test]
    fn enable_key_events_reaches_engine() {
        let view = view();
        let engine = view.engine().unwrap().clone();
        engine.call(keys::ENABLE_KEY_EVENTS_BINDING, vec![json!(true)]);
        assert!(engine.accepts_key_events());
    }

    #[test]
    fn invalid_scheme_fails_initialisation() {
        let view: WebView<HeadlessEngine> =
            WebView::create(Options::default().with_scheme_uri("no scheme here"));
        assert!(!view.loaded_ok());
        assert_eq!(view.state(), ViewState::Failed);
        assert!(view.engine().is_none());
        assert!(matches!(view.navigate("https://example.com"), Err(ViewError::NotReady)));
    }

    #[test]
    fn empty_binding_name_is_refused() {
        let view = view();
        let result = view.bind("", |_: &[Value]| Ok(Value::Null));
        assert_eq!(result.unwrap_err().code(), "invalid_request");
    }

    #[test]
    fn close_is_idempotent() {
        let mut view = view();
        view.close();
        view.close();
        assert_eq!(view.state(), ViewState::TornDown);
        assert!(view.bound_names().is_empty());
    }
}
