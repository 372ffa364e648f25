//! WebKitGTK engine adapter (Linux).

use super::{catch_boundary, Engine, EngineHooks, MessageHandler};
use crate::error::EngineError;
use crate::evaluation::Completion;
use crate::options::Options;
use crate::resource::{FetchOutcome, ResourceResponse, ResourceServer};
use gtk::gdk;
use gtk::gio::{Cancellable, MemoryInputStream};
use gtk::glib::{self, SignalHandlerId};
use gtk::prelude::*;
use javascriptcore::ValueExt;
use soup::{MessageHeaders, MessageHeadersType};
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;
use webkit2gtk::{
    JavascriptResult, NetworkError, SettingsExt, URISchemeRequest, URISchemeRequestExt,
    URISchemeResponse, URISchemeResponseExt, UserContentInjectedFrames, UserContentManager,
    UserContentManagerExt, UserScript, UserScriptInjectionTime, WebContext, WebContextExt,
    WebInspectorExt, WebView, WebViewExt,
};

const MESSAGE_HANDLER: &str = "external";

pub struct WebKitGtkEngine {
    // kept alive for the scheme handler registered on it
    _context: WebContext,
    webview: WebView,
    manager: UserContentManager,
    message_signal: RefCell<Option<SignalHandlerId>>,
}

impl Engine for WebKitGtkEngine {
    const POST_MESSAGE_FN: &'static str = "window.webkit.messageHandlers.external.postMessage";

    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError> {
        gtk::init().map_err(|err| EngineError::new("init_failed", format!("gtk: {err}")))?;

        let context = WebContext::new();
        let webview = WebView::with_context(&context);
        let manager = webview
            .user_content_manager()
            .ok_or_else(|| EngineError::new("init_failed", "web view has no user content manager"))?;

        let on_message: MessageHandler = Rc::clone(&hooks.on_message);
        let signal = manager.connect_script_message_received(
            Some(MESSAGE_HANDLER),
            move |_manager, result: &JavascriptResult| {
                if let Some(value) = result.js_value() {
                    let raw = value.to_string();
                    catch_boundary("script message", || on_message(&raw));
                }
            },
        );
        if !manager.register_script_message_handler(MESSAGE_HANDLER) {
            return Err(EngineError::new("init_failed", "could not register script message handler"));
        }

        if let Some(settings) = WebViewExt::settings(&webview) {
            settings.set_javascript_can_access_clipboard(true);
            if options.debug {
                settings.set_enable_write_console_messages_to_stdout(true);
                settings.set_enable_developer_extras(true);
            }
            if let Some(agent) = options.user_agent() {
                settings.set_user_agent(Some(agent));
            }
        }

        if options.debug_inspector {
            if let Some(inspector) = webview.inspector() {
                inspector.show();
            }
        }

        if options.transparent_background {
            webview.set_background_color(&gdk::RGBA::new(0.0, 0.0, 0.0, 0.0));
        }

        if let Some(resources) = hooks.resources {
            log::debug!("serving {}:// from the resource resolver", hooks.scheme);
            context.register_uri_scheme(&hooks.scheme, move |request| {
                if catch_boundary("resource request", || serve_request(&resources, request)).is_none() {
                    fail_request(request);
                }
            });
        }

        webview.show_all();

        Ok(Self {
            _context: context,
            webview,
            manager,
            message_signal: RefCell::new(Some(signal)),
        })
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.webview.as_ptr() as *mut c_void)
    }

    fn navigate(&self, url: &str) -> Result<(), EngineError> {
        self.webview.load_uri(url);
        Ok(())
    }

    fn set_html(&self, html: &str) -> Result<(), EngineError> {
        self.webview.load_html(html, None);
        Ok(())
    }

    fn add_init_script(&self, script: &str) -> Result<(), EngineError> {
        let script = UserScript::new(
            script,
            UserContentInjectedFrames::TopFrame,
            UserScriptInjectionTime::Start,
            &[],
            &[],
        );
        self.manager.add_script(&script);
        Ok(())
    }

    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError> {
        let cancellable: Option<&Cancellable> = None;
        match completion {
            Some(completion) => self.webview.run_javascript(script, cancellable, move |result| {
                catch_boundary("script completion", move || match result {
                    Ok(js_result) => {
                        // `to_json` is None for `undefined`
                        let value = js_result
                            .js_value()
                            .map(|value| value.to_json(0).map(|json| json.to_string()));
                        completion.finish_value(value);
                    }
                    Err(err) => completion.finish(Some(err.message().to_string()), None),
                });
            }),
            None => self.webview.run_javascript(script, cancellable, |_| ()),
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(signal) = self.message_signal.borrow_mut().take() {
            self.manager.disconnect(signal);
        }
        self.manager.unregister_script_message_handler(MESSAGE_HANDLER);
    }
}

fn serve_request(resources: &ResourceServer, request: &URISchemeRequest) {
    let path = request.path().map(|path| path.to_string()).unwrap_or_default();
    match resources.serve_path(&path) {
        FetchOutcome::Response(response) => finish_with(request, response),
        FetchOutcome::Failed => fail_request(request),
    }
}

fn finish_with(request: &URISchemeRequest, response: ResourceResponse) {
    let length = if response.body.is_empty() {
        -1
    } else {
        response.body.len() as i64
    };
    let stream = MemoryInputStream::from_bytes(&glib::Bytes::from_owned(response.body.clone()));
    let reply = URISchemeResponse::new(&stream, length);
    reply.set_status(u32::from(response.status), Some(response.reason));
    if let Some(mime) = response.content_type() {
        reply.set_content_type(mime);
    }
    if !response.headers.is_empty() {
        let mut headers = MessageHeaders::new(MessageHeadersType::Response);
        for (name, value) in &response.headers {
            headers.append(name, value);
        }
        reply.set_http_headers(&mut headers);
    }
    request.finish_with_response(&reply);
}

fn fail_request(request: &URISchemeRequest) {
    request.finish_error(&mut glib::Error::new(NetworkError::Failed, "Something went wrong"));
}
