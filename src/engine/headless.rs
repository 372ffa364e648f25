//! In-process engine with no renderer.
//!
//! Records what the view asks of the page and lets the caller play the
//! page's side: posting bridge messages, requesting resources and answering
//! evaluations in whatever order it likes. Used when no native engine is
//! compiled in and by the test suite.

use super::{catch_boundary, Engine, EngineHooks};
use crate::error::EngineError;
use crate::evaluation::Completion;
use crate::options::Options;
use crate::resource::FetchOutcome;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

const BLANK_URL: &str = "about:blank";

/// Cheap handle; clones share the same page.
#[derive(Clone)]
pub struct HeadlessEngine {
    inner: Rc<HeadlessPage>,
}

struct HeadlessPage {
    hooks: EngineHooks,
    user_agent: Option<String>,
    accept_key_events: Cell<bool>,
    state: RefCell<PageState>,
}

struct PageState {
    url: String,
    html: Option<String>,
    loads: u64,
    message_id: u64,
    init_scripts: Vec<String>,
    evaluated: Vec<String>,
    pending: VecDeque<PendingEvaluation>,
    requests: Vec<String>,
    shut_down: bool,
}

struct PendingEvaluation {
    script: String,
    completion: Completion,
}

impl HeadlessEngine {
    pub fn current_url(&self) -> String {
        self.inner.state.borrow().url.clone()
    }

    /// Markup of the current page, from `set_html` or a served `text/html`.
    pub fn current_html(&self) -> Option<String> {
        self.inner.state.borrow().html.clone()
    }

    pub fn load_count(&self) -> u64 {
        self.inner.state.borrow().loads
    }

    pub fn user_agent(&self) -> Option<String> {
        self.inner.user_agent.clone()
    }

    pub fn init_scripts(&self) -> Vec<String> {
        self.inner.state.borrow().init_scripts.clone()
    }

    /// Every submitted script, in submission order.
    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.inner.state.borrow().evaluated.clone()
    }

    /// Paths requested from the resource resolver, in order.
    pub fn requested_paths(&self) -> Vec<String> {
        self.inner.state.borrow().requests.clone()
    }

    pub fn pending_evaluations(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    /// Script of the oldest evaluation still waiting for an answer.
    pub fn next_pending_script(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .pending
            .front()
            .map(|pending| pending.script.clone())
    }

    pub fn accepts_key_events(&self) -> bool {
        self.inner.accept_key_events.get()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.borrow().shut_down
    }

    /// Delivers a raw string as if the page had posted it.
    pub fn post_message(&self, raw: &str) {
        if self.is_shut_down() {
            log::debug!("headless page is shut down; message dropped");
            return;
        }
        let on_message = Rc::clone(&self.inner.hooks.on_message);
        catch_boundary("message", || on_message(raw));
    }

    /// Calls `window[function](...params)` the way a bound shim does and
    /// returns the message id the page would wait on.
    pub fn call(&self, function: &str, params: Vec<Value>) -> u64 {
        let id = {
            let mut state = self.inner.state.borrow_mut();
            state.message_id += 1;
            state.message_id
        };
        let message = json!({ "id": id, "fn": function, "params": params });
        self.post_message(&message.to_string());
        id
    }

    /// Requests `path` from the resource resolver, as a page load or a
    /// subresource fetch would. `None` when the view serves no resources.
    pub fn fetch(&self, path: &str) -> Option<FetchOutcome> {
        let resources = self.inner.hooks.resources.as_ref()?;
        self.inner.state.borrow_mut().requests.push(path.to_string());
        Some(resources.serve_path(path))
    }

    /// Answers the oldest pending evaluation. Returns false if none is waiting.
    pub fn complete_next(&self, native_error: Option<&str>, json: Option<&str>) -> bool {
        let pending = self.inner.state.borrow_mut().pending.pop_front();
        let Some(pending) = pending else {
            return false;
        };
        let native_error = native_error.map(str::to_string);
        catch_boundary("script completion", || {
            pending.completion.finish(native_error, json)
        });
        true
    }

    fn begin_load(&self, url: &str, html: Option<String>) {
        let mut state = self.inner.state.borrow_mut();
        state.url = url.to_string();
        state.html = html;
        state.loads += 1;
        // a fresh page gets a fresh `_fnBindings` counter
        state.message_id = 1;
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::unavailable("headless page is shut down"));
        }
        Ok(())
    }
}

impl Engine for HeadlessEngine {
    const POST_MESSAGE_FN: &'static str = "window.webbridge.postMessage";

    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError> {
        log::debug!("starting headless engine (home {})", hooks.home_uri);
        let page = HeadlessPage {
            hooks,
            user_agent: options.user_agent().map(str::to_string),
            accept_key_events: Cell::new(false),
            state: RefCell::new(PageState {
                url: BLANK_URL.to_string(),
                html: None,
                loads: 0,
                message_id: 1,
                init_scripts: Vec::new(),
                evaluated: Vec::new(),
                pending: VecDeque::new(),
                requests: Vec::new(),
                shut_down: false,
            }),
        };
        Ok(Self {
            inner: Rc::new(page),
        })
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        NonNull::new(Rc::as_ptr(&self.inner) as *mut c_void)
    }

    fn navigate(&self, url: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.begin_load(url, None);

        let home = &self.inner.hooks.home_uri;
        if let Some(rest) = url.strip_prefix(home.as_str()) {
            let path = format!("/{rest}");
            if let Some(FetchOutcome::Response(response)) = self.fetch(&path) {
                let is_html = response
                    .content_type()
                    .is_some_and(|mime| mime.starts_with("text/html"));
                if response.status == 200 && is_html {
                    let html = String::from_utf8_lossy(&response.body).into_owned();
                    self.inner.state.borrow_mut().html = Some(html);
                }
            }
        }
        Ok(())
    }

    fn set_html(&self, html: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.begin_load(BLANK_URL, Some(html.to_string()));
        Ok(())
    }

    fn add_init_script(&self, script: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner
            .state
            .borrow_mut()
            .init_scripts
            .push(script.to_string());
        Ok(())
    }

    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError> {
        self.ensure_running()?;
        let mut state = self.inner.state.borrow_mut();
        state.evaluated.push(script.to_string());
        if let Some(completion) = completion {
            state.pending.push_back(PendingEvaluation {
                script: script.to_string(),
                completion,
            });
        }
        Ok(())
    }

    fn set_accept_key_events(&self, accept: bool) {
        self.inner.accept_key_events.set(accept);
    }

    fn shutdown(&self) {
        self.inner.state.borrow_mut().shut_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvalResult;
    use crate::liveness::Liveness;
    use crate::resource::{Resource, ResourceServer};
    use std::sync::Arc;

    fn engine_with(messages: Rc<RefCell<Vec<String>>>, resources: Option<ResourceServer>) -> HeadlessEngine {
        let hooks = EngineHooks {
            on_message: Rc::new(move |raw: &str| messages.borrow_mut().push(raw.to_string())),
            resources,
            home_uri: "webbridge://webbridge.local/".into(),
            scheme: "webbridge".into(),
        };
        HeadlessEngine::create(&Options::default(), hooks).unwrap()
    }

    #[test]
    fn calls_use_a_per_page_counter() {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let engine = engine_with(Rc::clone(&messages), None);

        assert_eq!(engine.call("f", vec![json!(1)]), 2);
        assert_eq!(engine.call("f", vec![]), 3);
        engine.set_html("<p>reloaded</p>").unwrap();
        assert_eq!(engine.call("g", vec![]), 2);

        let first: Value = serde_json::from_str(&messages.borrow()[0]).unwrap();
        assert_eq!(first, json!({"id": 2, "fn": "f", "params": [1]}));
        assert_eq!(messages.borrow().len(), 3);
    }

    #[test]
    fn navigating_home_requests_root() {
        let server = ResourceServer::new(Arc::new(|path: &str| {
            (path == "/").then(|| Resource::new("<h1>home</h1>", "text/html"))
        }));
        let engine = engine_with(Rc::new(RefCell::new(Vec::new())), Some(server));

        engine.navigate("webbridge://webbridge.local/").unwrap();
        assert_eq!(engine.requested_paths(), vec!["/"]);
        assert_eq!(engine.current_html().as_deref(), Some("<h1>home</h1>"));

        engine.navigate("https://example.com/").unwrap();
        assert_eq!(engine.requested_paths().len(), 1);
        assert_eq!(engine.current_html(), None);
    }

    #[test]
    fn completions_fire_in_caller_chosen_order() {
        let engine = engine_with(Rc::new(RefCell::new(Vec::new())), None);
        let results = Rc::new(RefCell::new(Vec::new()));
        for label in ["a", "b"] {
            let sink = Rc::clone(&results);
            let completion = Completion::new(
                Box::new(move |result: EvalResult| sink.borrow_mut().push((label, result))),
                Liveness::new(),
            );
            engine.evaluate(label, Some(completion)).unwrap();
        }
        engine.evaluate("fire-and-forget", None).unwrap();

        assert_eq!(engine.pending_evaluations(), 2);
        assert_eq!(engine.next_pending_script().as_deref(), Some("a"));
        assert!(engine.complete_next(None, Some("1")));
        assert!(engine.complete_next(Some("boom"), None));
        assert!(!engine.complete_next(None, None));

        let results = results.borrow();
        assert_eq!(results[0], ("a", Ok(json!(1))));
        assert_eq!(results[1].0, "b");
        assert!(results[1].1.is_err());
        assert_eq!(engine.evaluated_scripts(), vec!["a", "b", "fire-and-forget"]);
    }

    #[test]
    fn shut_down_page_refuses_work() {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let engine = engine_with(Rc::clone(&messages), None);
        engine.shutdown();
        assert!(engine.navigate("https://example.com").is_err());
        assert!(engine.evaluate("1", None).is_err());
        engine.post_message("{}");
        assert!(messages.borrow().is_empty());
    }
}
