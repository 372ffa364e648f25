//! WKWebView engine adapter (macOS).

use super::{catch_boundary, Engine, EngineHooks, MessageHandler};
use crate::error::EngineError;
use crate::evaluation::Completion;
use crate::options::Options;
use crate::resource::{FetchOutcome, ResourceResponse, ResourceServer};
use block2::RcBlock;
use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject, Sel};
use objc2::{
    define_class, msg_send, sel, AllocAnyThread, DefinedClass, MainThreadMarker, MainThreadOnly,
};
use objc2_app_kit::{NSApplication, NSEvent, NSEventModifierFlags, NSEventType, NSResponder, NSView};
use objc2_foundation::{
    ns_string, NSData, NSDictionary, NSError, NSHTTPURLResponse, NSJSONSerialization,
    NSJSONWritingOptions, NSNumber, NSObject, NSObjectNSKeyValueCoding, NSObjectProtocol, NSRect,
    NSString, NSURLRequest, NSURL,
};
use objc2_web_kit::{
    WKNavigation, WKNavigationDelegate, WKScriptMessage, WKScriptMessageHandler, WKURLSchemeHandler,
    WKURLSchemeTask, WKUserContentController, WKUserScript, WKUserScriptInjectionTime, WKWebView,
    WKWebViewConfiguration,
};
use std::cell::Cell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

const NS_URL_ERROR_CANCELLED: isize = -999;

struct DelegateIvars {
    on_message: MessageHandler,
    resources: Option<ResourceServer>,
}

define_class!(
    #[unsafe(super(NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "WebBridgeDelegate"]
    #[ivars = DelegateIvars]
    struct BridgeDelegate;

    unsafe impl NSObjectProtocol for BridgeDelegate {}

    unsafe impl WKScriptMessageHandler for BridgeDelegate {
        #[unsafe(method(userContentController:didReceiveScriptMessage:))]
        fn did_receive_script_message(
            &self,
            _controller: &WKUserContentController,
            message: &WKScriptMessage,
        ) {
            let body = unsafe { message.body() };
            let Some(text) = body.downcast_ref::<NSString>() else {
                log::debug!("ignoring non-string script message");
                return;
            };
            let raw = text.to_string();
            let on_message = Rc::clone(&self.ivars().on_message);
            catch_boundary("script message", || on_message(&raw));
        }
    }

    unsafe impl WKURLSchemeHandler for BridgeDelegate {
        #[unsafe(method(webView:startURLSchemeTask:))]
        fn start_url_scheme_task(
            &self,
            _web_view: &WKWebView,
            task: &ProtocolObject<dyn WKURLSchemeTask>,
        ) {
            if catch_boundary("resource request", || self.serve(task)).is_none() {
                fail_task(task);
            }
        }

        #[unsafe(method(webView:stopURLSchemeTask:))]
        fn stop_url_scheme_task(
            &self,
            _web_view: &WKWebView,
            _task: &ProtocolObject<dyn WKURLSchemeTask>,
        ) {
        }
    }

    unsafe impl WKNavigationDelegate for BridgeDelegate {
        #[unsafe(method(webView:didFailProvisionalNavigation:withError:))]
        fn did_fail_provisional_navigation(
            &self,
            web_view: &WKWebView,
            _navigation: Option<&WKNavigation>,
            error: &NSError,
        ) {
            show_error_page(web_view, error);
        }

        #[unsafe(method(webView:didFailNavigation:withError:))]
        fn did_fail_navigation(
            &self,
            web_view: &WKWebView,
            _navigation: Option<&WKNavigation>,
            error: &NSError,
        ) {
            show_error_page(web_view, error);
        }
    }
);

impl BridgeDelegate {
    fn new(
        mtm: MainThreadMarker,
        on_message: MessageHandler,
        resources: Option<ResourceServer>,
    ) -> Retained<Self> {
        let this = Self::alloc(mtm).set_ivars(DelegateIvars {
            on_message,
            resources,
        });
        unsafe { msg_send![super(this), init] }
    }

    fn serve(&self, task: &ProtocolObject<dyn WKURLSchemeTask>) {
        let Some(resources) = &self.ivars().resources else {
            return fail_task(task);
        };
        let request = unsafe { task.request() };
        let Some(url) = request.URL() else {
            return fail_task(task);
        };
        let path = url.path().map(|path| path.to_string()).unwrap_or_default();
        match resources.serve_path(&path) {
            FetchOutcome::Response(response) => respond(task, &url, &response),
            FetchOutcome::Failed => fail_task(task),
        }
    }
}

struct WebViewIvars {
    accepts_first_mouse: bool,
    clipboard_shortcuts: bool,
    accept_key_events: Cell<bool>,
}

define_class!(
    #[unsafe(super(WKWebView, NSView, NSResponder, NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "WebBridgeWebView"]
    #[ivars = WebViewIvars]
    struct BridgeWebView;

    impl BridgeWebView {
        #[unsafe(method(acceptsFirstMouse:))]
        fn accepts_first_mouse(&self, _event: Option<&NSEvent>) -> bool {
            self.ivars().accepts_first_mouse
        }

        #[unsafe(method(performKeyEquivalent:))]
        fn perform_key_equivalent(&self, event: &NSEvent) -> bool {
            if self.ivars().clipboard_shortcuts {
                if let Some(action) = clipboard_action(event) {
                    return self.send_app_action(action);
                }
            }
            unsafe { msg_send![super(self), performKeyEquivalent: event] }
        }

        #[unsafe(method(keyDown:))]
        fn key_down(&self, event: &NSEvent) {
            if self.ivars().accept_key_events.get() {
                let _: () = unsafe { msg_send![super(self), keyDown: event] };
            } else if let Some(next) = self.nextResponder() {
                next.keyDown(event);
            }
        }

        #[unsafe(method(keyUp:))]
        fn key_up(&self, event: &NSEvent) {
            if self.ivars().accept_key_events.get() {
                let _: () = unsafe { msg_send![super(self), keyUp: event] };
            } else if let Some(next) = self.nextResponder() {
                next.keyUp(event);
            }
        }
    }
);

impl BridgeWebView {
    fn new(
        mtm: MainThreadMarker,
        config: &WKWebViewConfiguration,
        ivars: WebViewIvars,
    ) -> Retained<Self> {
        let this = Self::alloc(mtm).set_ivars(ivars);
        unsafe { msg_send![super(this), initWithFrame: NSRect::ZERO, configuration: config] }
    }

    fn send_app_action(&self, action: Sel) -> bool {
        let app = NSApplication::sharedApplication(self.mtm());
        let sender: &AnyObject = self;
        unsafe { app.sendAction_to_from(action, None, Some(sender)) }
    }
}

pub struct WkWebViewEngine {
    webview: Retained<BridgeWebView>,
    manager: Retained<WKUserContentController>,
    _delegate: Retained<BridgeDelegate>,
}

impl Engine for WkWebViewEngine {
    const POST_MESSAGE_FN: &'static str = "window.webkit.messageHandlers.external.postMessage";

    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError> {
        let mtm = MainThreadMarker::new().ok_or_else(|| {
            EngineError::new("init_failed", "WKWebView must be created on the main thread")
        })?;

        let config = unsafe { WKWebViewConfiguration::new(mtm) };
        let prefs = unsafe { config.preferences() };
        set_flag(&prefs, ns_string!("fullScreenEnabled"), true);
        set_flag(&prefs, ns_string!("DOMPasteAllowed"), true);
        set_flag(&prefs, ns_string!("javaScriptCanAccessClipboard"), true);
        if options.debug {
            set_flag(&prefs, ns_string!("developerExtrasEnabled"), true);
        }

        let delegate = BridgeDelegate::new(mtm, Rc::clone(&hooks.on_message), hooks.resources.clone());
        let manager = unsafe { config.userContentController() };
        unsafe {
            manager.addScriptMessageHandler_name(
                ProtocolObject::from_ref(&*delegate),
                ns_string!("external"),
            );
        }
        if hooks.resources.is_some() {
            unsafe {
                config.setURLSchemeHandler_forURLScheme(
                    Some(ProtocolObject::from_ref(&*delegate)),
                    &NSString::from_str(&hooks.scheme),
                );
            }
        }

        let webview = BridgeWebView::new(
            mtm,
            &config,
            WebViewIvars {
                accepts_first_mouse: options.accepts_first_mouse_click,
                clipboard_shortcuts: options.default_clipboard_shortcuts,
                accept_key_events: Cell::new(false),
            },
        );

        if let Some(agent) = options.user_agent() {
            unsafe { webview.setCustomUserAgent(Some(&NSString::from_str(agent))) };
        }
        if options.debug_inspector {
            unsafe { webview.setInspectable(true) };
        }
        unsafe { webview.setNavigationDelegate(Some(ProtocolObject::from_ref(&*delegate))) };
        if options.transparent_background {
            set_flag(&webview, ns_string!("drawsBackground"), false);
        }

        Ok(Self {
            webview,
            manager,
            _delegate: delegate,
        })
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        NonNull::new(Retained::as_ptr(&self.webview) as *mut c_void)
    }

    fn navigate(&self, url: &str) -> Result<(), EngineError> {
        let ns_url = NSURL::URLWithString(&NSString::from_str(url))
            .ok_or_else(|| EngineError::new("invalid_request", format!("not a valid URL: {url}")))?;
        let request = NSURLRequest::requestWithURL(&ns_url);
        unsafe { self.webview.loadRequest(&request) }
            .map(|_| ())
            .ok_or_else(|| EngineError::new("navigation_failed", format!("could not load {url}")))
    }

    fn set_html(&self, html: &str) -> Result<(), EngineError> {
        unsafe { self.webview.loadHTMLString_baseURL(&NSString::from_str(html), None) }
            .map(|_| ())
            .ok_or_else(|| EngineError::new("navigation_failed", "could not load HTML"))
    }

    fn add_init_script(&self, script: &str) -> Result<(), EngineError> {
        let script = unsafe {
            WKUserScript::initWithSource_injectionTime_forMainFrameOnly(
                WKUserScript::alloc(self.webview.mtm()),
                &NSString::from_str(script),
                WKUserScriptInjectionTime::AtDocumentStart,
                true,
            )
        };
        unsafe { self.manager.addUserScript(&script) };
        Ok(())
    }

    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError> {
        let source = NSString::from_str(script);
        let Some(completion) = completion else {
            unsafe { self.webview.evaluateJavaScript_completionHandler(&source, None) };
            return Ok(());
        };

        // blocks are Fn; the completion fires at most once
        let slot = Cell::new(Some(completion));
        let handler = RcBlock::new(move |result: *mut AnyObject, error: *mut NSError| {
            let Some(completion) = slot.take() else {
                return;
            };
            let result = unsafe { result.as_ref() };
            let error = unsafe { error.as_ref() };
            catch_boundary("script completion", move || {
                let native_error = error.map(error_message);
                let json = result.and_then(to_json);
                completion.finish(native_error, json.as_deref());
            });
        });
        unsafe { self.webview.evaluateJavaScript_completionHandler(&source, Some(&*handler)) };
        Ok(())
    }

    fn set_accept_key_events(&self, accept: bool) {
        self.webview.ivars().accept_key_events.set(accept);
    }

    fn shutdown(&self) {
        unsafe {
            self.webview.setNavigationDelegate(None);
            self.manager
                .removeScriptMessageHandlerForName(ns_string!("external"));
        }
    }
}

fn set_flag(object: &NSObject, key: &NSString, value: bool) {
    let number = NSNumber::new_bool(value);
    let value: &AnyObject = &number;
    unsafe { object.setValue_forKey(Some(value), key) };
}

fn respond(task: &ProtocolObject<dyn WKURLSchemeTask>, url: &NSURL, response: &ResourceResponse) {
    let keys: Vec<Retained<NSString>> = response
        .headers
        .iter()
        .map(|(name, _)| NSString::from_str(name))
        .collect();
    let values: Vec<Retained<NSString>> = response
        .headers
        .iter()
        .map(|(_, value)| NSString::from_str(value))
        .collect();
    let key_refs: Vec<&NSString> = keys.iter().map(|key| &**key).collect();
    let headers = NSDictionary::from_retained_objects(&key_refs, &values);

    let http = unsafe {
        NSHTTPURLResponse::initWithURL_statusCode_HTTPVersion_headerFields(
            NSHTTPURLResponse::alloc(),
            url,
            response.status as isize,
            Some(ns_string!("HTTP/1.1")),
            Some(&headers),
        )
    };
    let Some(http) = http else {
        return fail_task(task);
    };
    unsafe {
        task.didReceiveResponse(&http);
        if !response.body.is_empty() {
            task.didReceiveData(&NSData::with_bytes(&response.body));
        }
        task.didFinish();
    }
}

fn fail_task(task: &ProtocolObject<dyn WKURLSchemeTask>) {
    let error = NSError::new(-1, ns_string!("NSURLErrorDomain"));
    unsafe { task.didFailWithError(&error) };
}

fn show_error_page(web_view: &WKWebView, error: &NSError) {
    if error.code() == NS_URL_ERROR_CANCELLED {
        return;
    }
    let html = format!(
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h2>{}</h2></body></html>",
        escape_html(&error_message(error))
    );
    unsafe { web_view.loadHTMLString_baseURL(&NSString::from_str(&html), None) };
}

/// Prefers the script exception text WebKit attaches over the generic description.
fn error_message(error: &NSError) -> String {
    let user_info = error.userInfo();
    let exception = unsafe { user_info.objectForKey(ns_string!("WKJavaScriptExceptionMessage")) };
    if let Some(text) = exception.as_deref().and_then(|value| value.downcast_ref::<NSString>()) {
        let text = text.to_string();
        if !text.is_empty() {
            return text;
        }
    }
    error.localizedDescription().to_string()
}

fn to_json(value: &AnyObject) -> Option<String> {
    let options = NSJSONWritingOptions::FragmentsAllowed | NSJSONWritingOptions::WithoutEscapingSlashes;
    let data = unsafe { NSJSONSerialization::dataWithJSONObject_options_error(value, options) }.ok()?;
    String::from_utf8(data.to_vec()).ok()
}

fn clipboard_action(event: &NSEvent) -> Option<Sel> {
    if event.r#type() != NSEventType::KeyDown {
        return None;
    }
    let flags = event.modifierFlags()
        & (NSEventModifierFlags::Shift
            | NSEventModifierFlags::Command
            | NSEventModifierFlags::Control
            | NSEventModifierFlags::Option);
    let key = event.charactersIgnoringModifiers()?.to_string();

    if flags == NSEventModifierFlags::Command {
        match key.as_str() {
            "c" => Some(sel!(copy:)),
            "x" => Some(sel!(cut:)),
            "v" => Some(sel!(paste:)),
            "z" => Some(sel!(undo:)),
            "a" => Some(sel!(selectAll:)),
            _ => None,
        }
    } else if flags == NSEventModifierFlags::Shift | NSEventModifierFlags::Command && key == "Z" {
        Some(sel!(redo:))
    } else {
        None
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
