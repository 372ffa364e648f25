use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;
use webbridge::binding::{shim_script, unbind_script};
use webbridge::engine::{Engine, EngineHooks, HeadlessEngine};
use webbridge::evaluation::Completion;
use webbridge::keys::{KEY_DOWN_BINDING, KEY_UP_BINDING};
use webbridge::protocol::Settlement;
use webbridge::{
    BindingError, EngineError, EvalResult, FetchOutcome, KeyListener, Options, Resource,
    ResourceResponse, ScriptError, ViewError, ViewState, WebView,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn headless(options: Options) -> (WebView<HeadlessEngine>, HeadlessEngine) {
    init_logging();
    let view = WebView::<HeadlessEngine>::create(options);
    let engine = view.engine().expect("headless engine starts").clone();
    (view, engine)
}

fn sum(args: &[Value]) -> Result<Value, BindingError> {
    Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
}

#[test]
fn bound_function_call_resolves_its_promise() {
    let (view, engine) = headless(Options::default());
    view.bind("add", sum).unwrap();

    let shim = shim_script("add", HeadlessEngine::POST_MESSAGE_FN);
    assert!(engine.init_scripts().contains(&shim));
    assert!(engine.evaluated_scripts().contains(&shim));

    let id = engine.call("add", vec![json!(1), json!(2)]);
    let expected = Settlement::Resolve { id, value: json!(3) }.script();
    assert_eq!(engine.evaluated_scripts().last(), Some(&expected));
}

#[test]
fn concurrent_calls_settle_their_own_ids() {
    let (view, engine) = headless(Options::default());
    view.bind("echo", |args: &[Value]| Ok(args.first().cloned().unwrap_or(Value::Null)))
        .unwrap();

    let first = engine.call("echo", vec![json!("a")]);
    let second = engine.call("echo", vec![json!("b")]);
    assert_eq!((first, second), (2, 3));

    let scripts = engine.evaluated_scripts();
    assert!(scripts.contains(&Settlement::Resolve { id: 2, value: json!("a") }.script()));
    assert!(scripts.contains(&Settlement::Resolve { id: 3, value: json!("b") }.script()));
}

#[test]
fn failing_function_rejects() {
    let (view, engine) = headless(Options::default());
    view.bind("fail", |_: &[Value]| Err(BindingError::new("nope")))
        .unwrap();

    let id = engine.call("fail", vec![]);
    assert_eq!(
        engine.evaluated_scripts().last(),
        Some(&Settlement::Reject { id }.script())
    );
}

#[test]
fn panicking_function_rejects_and_view_survives() {
    let (view, engine) = headless(Options::default());
    view.bind("explode", |_: &[Value]| -> Result<Value, BindingError> { panic!("bug in handler") })
        .unwrap();

    let id = engine.call("explode", vec![]);
    assert_eq!(
        engine.evaluated_scripts().last(),
        Some(&Settlement::Reject { id }.script())
    );
    assert!(view.loaded_ok());
}

#[test]
fn rebinding_replaces_the_callback() {
    let (view, engine) = headless(Options::default());
    view.bind("version", |_: &[Value]| Ok(json!(1))).unwrap();
    view.bind("version", |_: &[Value]| Ok(json!(2))).unwrap();

    let id = engine.call("version", vec![]);
    assert_eq!(
        engine.evaluated_scripts().last(),
        Some(&Settlement::Resolve { id, value: json!(2) }.script())
    );
}

#[test]
fn unbind_removes_function_from_page_and_registry() {
    let (view, engine) = headless(Options::default());
    view.bind("add", sum).unwrap();
    view.unbind("add").unwrap();

    assert!(!view.is_bound("add"));
    assert_eq!(engine.evaluated_scripts().last(), Some(&unbind_script("add")));
    assert!(matches!(view.unbind("add"), Err(ViewError::NotBound(name)) if name == "add"));

    let before = engine.evaluated_scripts().len();
    engine.call("add", vec![json!(1)]);
    assert_eq!(engine.evaluated_scripts().len(), before);
}

#[test]
fn malformed_messages_are_ignored() {
    let (view, engine) = headless(Options::default());
    view.bind("add", sum).unwrap();
    let before = engine.evaluated_scripts().len();

    engine.post_message("not json at all");
    engine.post_message(r#"{"fn":"add","params":[]}"#);
    engine.post_message(r#"{"id":0,"fn":"add","params":[1]}"#);
    engine.post_message(r#"{"id":5,"fn":"add","params":"oops"}"#);
    engine.post_message(r#"{"id":6,"fn":"missing","params":[]}"#);

    assert_eq!(engine.evaluated_scripts().len(), before);
    assert!(view.loaded_ok());
}

#[test]
fn resources_are_served_from_home() {
    let (view, engine) = headless(
        Options::default()
            .with_user_agent("bridge-tests/1.0")
            .with_resources(|path| match path {
                "/" => Some(Resource::new("<h1>home</h1>", "text/html")),
                "/app.js" => Some(Resource::new("console.log(1)", "text/javascript")),
                "/broken" => panic!("resolver bug"),
                _ => None,
            }),
    );

    assert_eq!(engine.requested_paths().first().map(String::as_str), Some("/"));
    assert_eq!(engine.current_url(), view.home_uri());
    assert_eq!(engine.current_html().as_deref(), Some("<h1>home</h1>"));

    let Some(FetchOutcome::Response(script)) = engine.fetch("/app.js") else {
        panic!("expected a response for /app.js");
    };
    assert_eq!(script.status, 200);
    assert_eq!(script.content_type(), Some("text/javascript"));
    assert_eq!(script.header("Cache-Control"), Some("no-store"));
    assert_eq!(script.header("User-Agent"), Some("bridge-tests/1.0"));

    assert_eq!(
        engine.fetch("/missing"),
        Some(FetchOutcome::Response(ResourceResponse::not_found()))
    );
    assert_eq!(engine.fetch("/broken"), Some(FetchOutcome::Failed));
    assert!(view.loaded_ok());
}

#[test]
fn without_resolver_nothing_is_loaded() {
    let (_view, engine) = headless(Options::default());
    assert_eq!(engine.load_count(), 0);
    assert_eq!(engine.fetch("/"), None);
}

#[test]
fn custom_scheme_sets_home() {
    let (view, engine) = headless(
        Options::default()
            .with_scheme_uri("app://my.app")
            .with_resources(|_| None),
    );
    assert_eq!(view.home_uri(), "app://my.app/");
    view.navigate("").unwrap();
    assert_eq!(engine.current_url(), "app://my.app/");
    assert_eq!(engine.load_count(), 2);
}

#[test]
fn evaluation_results_are_decoded() {
    let (view, engine) = headless(Options::default());
    let results: Rc<RefCell<Vec<EvalResult>>> = Rc::default();

    for script in ["({a: 1})", "undefined", "throw 1"] {
        let sink = Rc::clone(&results);
        view.evaluate_with(script, move |result| sink.borrow_mut().push(result))
            .unwrap();
    }
    assert_eq!(engine.next_pending_script().as_deref(), Some("({a: 1})"));
    engine.complete_next(None, Some(r#"{"a":1}"#));
    engine.complete_next(None, None);
    engine.complete_next(Some("Error: 1"), None);

    assert_eq!(
        *results.borrow(),
        vec![
            Ok(json!({"a": 1})),
            Ok(Value::Null),
            Err(ScriptError::new("Error: 1")),
        ]
    );
}

#[test]
fn completion_after_teardown_never_runs() {
    let (view, engine) = headless(Options::default());
    let ran = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&ran);
    view.evaluate_with("slow()", move |_| *flag.borrow_mut() = true)
        .unwrap();

    drop(view);
    assert!(engine.is_shut_down());
    assert!(engine.complete_next(None, Some("1")));
    assert!(!*ran.borrow());
}

#[test]
fn closed_view_refuses_everything() {
    let (mut view, engine) = headless(Options::default());
    view.bind("add", sum).unwrap();
    view.close();

    assert_eq!(view.state(), ViewState::TornDown);
    assert!(!view.loaded_ok());
    assert!(view.view_handle().is_none());
    assert!(matches!(view.navigate("https://example.com"), Err(ViewError::NotReady)));
    assert!(matches!(view.evaluate("1"), Err(ViewError::NotReady)));
    assert!(matches!(view.bind("x", sum), Err(ViewError::NotReady)));

    let before = engine.evaluated_scripts().len();
    engine.post_message(r#"{"id":2,"fn":"add","params":[1]}"#);
    assert_eq!(engine.evaluated_scripts().len(), before);
}

#[test]
fn callback_may_drop_its_own_view() {
    init_logging();
    let slot: Rc<RefCell<Option<WebView<HeadlessEngine>>>> = Rc::default();
    let view = WebView::<HeadlessEngine>::create(Options::default());
    let engine = view.engine().unwrap().clone();

    let owner = Rc::clone(&slot);
    view.bind("quit", move |_: &[Value]| {
        drop(owner.borrow_mut().take());
        Ok(json!("bye"))
    })
    .unwrap();
    *slot.borrow_mut() = Some(view);

    let id = engine.call("quit", vec![]);
    assert!(slot.borrow().is_none());
    assert!(engine.is_shut_down());
    let settle = Settlement::Resolve { id, value: json!("bye") }.script();
    assert!(!engine.evaluated_scripts().contains(&settle));
}

#[derive(Default)]
struct RecordingListener {
    events: RefCell<Vec<String>>,
}

impl KeyListener for RecordingListener {
    fn on_key_down(&self, key: &str) {
        self.events.borrow_mut().push(format!("down:{key}"));
    }

    fn on_key_up(&self, key: &str) {
        self.events.borrow_mut().push(format!("up:{key}"));
    }
}

#[test]
fn key_events_reach_listeners() {
    let (view, engine) = headless(Options::default());
    let recorder = Rc::new(RecordingListener::default());
    let listener: Rc<dyn KeyListener> = recorder.clone();
    view.add_key_listener(Rc::clone(&listener));
    view.add_key_listener(Rc::clone(&listener));

    engine.call(KEY_DOWN_BINDING, vec![json!("KeyA")]);
    engine.call(KEY_UP_BINDING, vec![json!("KeyA")]);
    view.remove_key_listener(&listener);
    engine.call(KEY_DOWN_BINDING, vec![json!("KeyB")]);

    assert_eq!(*recorder.events.borrow(), vec!["down:KeyA", "up:KeyA"]);
}

#[test]
fn set_html_loads_markup() {
    let (view, engine) = headless(Options::default());
    view.set_html("<p>hello</p>").unwrap();
    assert_eq!(engine.current_html().as_deref(), Some("<p>hello</p>"));
    assert_eq!(engine.current_url(), "about:blank");
}

struct BrokenEngine;

impl Engine for BrokenEngine {
    const POST_MESSAGE_FN: &'static str = "window.broken.postMessage";

    fn create(_options: &Options, _hooks: EngineHooks) -> Result<Self, EngineError> {
        Err(EngineError::new("init_failed", "no display"))
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        None
    }

    fn navigate(&self, _url: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_html(&self, _html: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn add_init_script(&self, _script: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn evaluate(&self, _script: &str, _completion: Option<Completion>) -> Result<(), EngineError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

#[test]
fn engine_failure_leaves_view_unusable() {
    init_logging();
    let view = WebView::<BrokenEngine>::create(Options::default().with_resources(|_| None));
    assert!(!view.loaded_ok());
    assert_eq!(view.state(), ViewState::Failed);
    assert!(view.bound_names().is_empty());
    assert!(matches!(view.bind("f", sum), Err(ViewError::NotReady)));
    assert!(matches!(view.set_html("<p></p>"), Err(ViewError::NotReady)));
}

#[test]
fn init_scripts_are_registered_for_later_loads() {
    let (view, engine) = headless(Options::default());
    view.add_init_script("window.ready = true;").unwrap();
    assert_eq!(
        engine.init_scripts().last().map(String::as_str),
        Some("window.ready = true;")
    );
}

/// Starts normally but refuses to inject scripts.
struct ScriptRejectingEngine {
    page: HeadlessEngine,
}

impl Engine for ScriptRejectingEngine {
    const POST_MESSAGE_FN: &'static str = HeadlessEngine::POST_MESSAGE_FN;

    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError> {
        HeadlessEngine::create(options, hooks).map(|page| Self { page })
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        self.page.view_handle()
    }

    fn navigate(&self, url: &str) -> Result<(), EngineError> {
        self.page.navigate(url)
    }

    fn set_html(&self, html: &str) -> Result<(), EngineError> {
        self.page.set_html(html)
    }

    fn add_init_script(&self, _script: &str) -> Result<(), EngineError> {
        Err(EngineError::new("script_failed", "content manager rejected script"))
    }

    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError> {
        self.page.evaluate(script, completion)
    }

    fn shutdown(&self) {
        self.page.shutdown();
    }
}

#[test]
fn bind_fails_when_engine_rejects_the_shim() {
    init_logging();
    let view = WebView::<ScriptRejectingEngine>::create(Options::default());
    assert!(view.loaded_ok());
    let page = view.engine().unwrap().page.clone();

    let err = view.bind("add", sum).unwrap_err();
    assert!(matches!(&err, ViewError::Engine(inner) if inner.code == "script_failed"));
    assert_eq!(err.code(), "script_failed");
    assert!(!view.is_bound("add"));

    let before = page.evaluated_scripts().len();
    page.post_message(r#"{"id":2,"fn":"add","params":[1,2]}"#);
    assert_eq!(page.evaluated_scripts().len(), before);
}
