//! WebView2 engine adapter (Windows).
//!
//! The controller lives in a hidden `WS_POPUP` host window that the
//! application reparents. Page resources and `set_html` content are both
//! served through a `WebResourceRequested` filter on the home URI.

use super::{catch_boundary, Engine, EngineHooks, MessageHandler};
use crate::error::EngineError;
use crate::evaluation::Completion;
use crate::options::Options;
use crate::resource::{FetchOutcome, Resource, ResourceResponse, ResourceServer};
use std::cell::RefCell;
use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::mpsc;
use webview2_com::Microsoft::Web::WebView2::Win32::{
    CreateCoreWebView2EnvironmentWithOptions, ICoreWebView2,
    ICoreWebView2AddScriptToExecuteOnDocumentCreatedCompletedHandler, ICoreWebView2Controller,
    ICoreWebView2Controller2, ICoreWebView2Environment, ICoreWebView2EnvironmentOptions,
    ICoreWebView2Settings2, ICoreWebView2WebResourceResponse, COREWEBVIEW2_COLOR,
    COREWEBVIEW2_PERMISSION_KIND, COREWEBVIEW2_PERMISSION_KIND_CLIPBOARD_READ,
    COREWEBVIEW2_PERMISSION_STATE_ALLOW, COREWEBVIEW2_WEB_RESOURCE_CONTEXT_ALL,
};
use webview2_com::{
    take_pwstr, CreateCoreWebView2ControllerCompletedHandler,
    CreateCoreWebView2EnvironmentCompletedHandler, ExecuteScriptCompletedHandler,
    PermissionRequestedEventHandler, WebMessageReceivedEventHandler,
    WebResourceRequestedEventHandler,
};
use windows::core::{w, Interface, HSTRING, PCWSTR, PWSTR};
use windows::Win32::Foundation::{E_FAIL, HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Shell::SHCreateMemStream;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetClientRect, GetMessageW,
    GetWindowLongPtrW, KillTimer, RegisterClassW, SetTimer, SetWindowLongPtrW, TranslateMessage,
    GWLP_USERDATA, MSG, WINDOW_EX_STYLE, WM_SIZE, WM_TIMER, WNDCLASSW, WS_POPUP,
};

const INIT_TIMEOUT_MS: u32 = 6000;
const HOST_CLASS: PCWSTR = w!("WebBridgeHost");
const SET_HTML_PATH: &str = "getHTMLInternal";

/// Answers intercepted requests under the home URI.
struct PageSource {
    home_uri: String,
    set_html_uri: String,
    page_html: RefCell<Option<String>>,
    resources: Option<ResourceServer>,
}

impl PageSource {
    fn serve(&self, uri: &str) -> FetchOutcome {
        if uri == self.set_html_uri {
            let html = self.page_html.borrow().clone().unwrap_or_default();
            return FetchOutcome::Response(ResourceResponse::ok(Resource::new(html, "text/html")));
        }
        match (&self.resources, uri.strip_prefix(self.home_uri.as_str())) {
            (Some(resources), Some(rest)) => resources.serve_path(&format!("/{rest}")),
            _ => FetchOutcome::Response(ResourceResponse::not_found()),
        }
    }
}

pub struct WebView2Engine {
    hwnd: HWND,
    controller: ICoreWebView2Controller,
    webview: ICoreWebView2,
    pages: Rc<PageSource>,
    message_token: i64,
    permission_token: i64,
    resource_token: i64,
}

impl Engine for WebView2Engine {
    const POST_MESSAGE_FN: &'static str = "window.chrome.webview.postMessage";

    fn create(options: &Options, hooks: EngineHooks) -> Result<Self, EngineError> {
        // S_FALSE when the thread is already initialised
        let _ = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };

        let hwnd = create_host_window()?;
        let created = create_controller(hwnd).and_then(|(environment, controller)| {
            let webview = unsafe { controller.CoreWebView2() }.map_err(com_error("init_failed"))?;
            Ok((environment, controller, webview))
        });
        let (environment, controller, webview) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe {
                    let _ = DestroyWindow(hwnd);
                }
                return Err(err);
            }
        };

        unsafe {
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, controller.as_raw() as isize);
            let _ = controller.SetIsVisible(true);
        }
        fit_to_window(hwnd, &controller);

        let pages = Rc::new(PageSource {
            set_html_uri: format!("{}{SET_HTML_PATH}", hooks.home_uri),
            home_uri: hooks.home_uri.clone(),
            page_html: RefCell::new(None),
            resources: hooks.resources.clone(),
        });

        let message_token = add_message_handler(&webview, Rc::clone(&hooks.on_message))?;
        let permission_token = add_permission_handler(&webview)?;
        let resource_token = add_resource_handler(&webview, &environment, &hooks.home_uri, Rc::clone(&pages))?;

        apply_settings(options, &webview, &controller)?;

        Ok(Self {
            hwnd,
            controller,
            webview,
            pages,
            message_token,
            permission_token,
            resource_token,
        })
    }

    fn view_handle(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.hwnd.0)
    }

    fn navigate(&self, url: &str) -> Result<(), EngineError> {
        unsafe { self.webview.Navigate(&HSTRING::from(url)) }.map_err(com_error("navigation_failed"))
    }

    fn set_html(&self, html: &str) -> Result<(), EngineError> {
        *self.pages.page_html.borrow_mut() = Some(html.to_string());
        self.navigate(&self.pages.set_html_uri)
    }

    fn add_init_script(&self, script: &str) -> Result<(), EngineError> {
        unsafe {
            self.webview.AddScriptToExecuteOnDocumentCreated(
                &HSTRING::from(script),
                None::<&ICoreWebView2AddScriptToExecuteOnDocumentCreatedCompletedHandler>,
            )
        }
        .map_err(com_error("script_failed"))
    }

    fn evaluate(&self, script: &str, completion: Option<Completion>) -> Result<(), EngineError> {
        let handler = completion.map(|completion| {
            ExecuteScriptCompletedHandler::create(Box::new(move |status, json: String| {
                let native_error = status.err().map(|err| err.message().to_string());
                catch_boundary("script completion", move || completion.finish(native_error, Some(&json)));
                Ok(())
            }))
        });
        unsafe { self.webview.ExecuteScript(&HSTRING::from(script), handler.as_ref()) }
            .map_err(com_error("script_failed"))
    }

    fn shutdown(&self) {
        unsafe {
            let _ = self.webview.remove_WebMessageReceived(self.message_token);
            let _ = self.webview.remove_PermissionRequested(self.permission_token);
            let _ = self.webview.remove_WebResourceRequested(self.resource_token);
            let _ = self.controller.Close();
            SetWindowLongPtrW(self.hwnd, GWLP_USERDATA, 0);
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

fn com_error(code: &'static str) -> impl Fn(windows::core::Error) -> EngineError {
    move |err| EngineError::new(code, err.message().to_string())
}

fn create_host_window() -> Result<HWND, EngineError> {
    unsafe {
        let instance = GetModuleHandleW(None).map_err(com_error("init_failed"))?;
        let class = WNDCLASSW {
            lpfnWndProc: Some(host_window_proc),
            hInstance: instance.into(),
            lpszClassName: HOST_CLASS,
            ..Default::default()
        };
        // zero when the class is already registered, which is fine
        RegisterClassW(&class);
        CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            HOST_CLASS,
            w!(""),
            WS_POPUP,
            0,
            0,
            400,
            400,
            None,
            None,
            Some(instance.into()),
            None,
        )
        .map_err(com_error("init_failed"))
    }
}

unsafe extern "system" fn host_window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if msg == WM_SIZE {
        let raw = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut c_void;
        if let Some(controller) = ICoreWebView2Controller::from_raw_borrowed(&raw) {
            fit_to_window(hwnd, controller);
        }
    }
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

fn fit_to_window(hwnd: HWND, controller: &ICoreWebView2Controller) {
    let mut rect = RECT::default();
    unsafe {
        if GetClientRect(hwnd, &mut rect).is_ok() {
            let _ = controller.SetBounds(rect);
        }
    }
}

fn user_data_folder() -> Option<PathBuf> {
    let app_data = std::env::var_os("APPDATA")?;
    let exe = std::env::current_exe().ok()?;
    Some(PathBuf::from(app_data).join(exe.file_name()?))
}

/// Runs the environment/controller handshake, pumping messages until both
/// arrive or the timeout fires.
fn create_controller(hwnd: HWND) -> Result<(ICoreWebView2Environment, ICoreWebView2Controller), EngineError> {
    let folder = user_data_folder()
        .ok_or_else(|| EngineError::new("init_failed", "no user data folder for WebView2"))?;

    let (env_tx, env_rx) = mpsc::channel();
    let handler = CreateCoreWebView2EnvironmentCompletedHandler::create(Box::new(move |status, environment| {
        let _ = env_tx.send(status.and(environment.ok_or_else(|| E_FAIL.into())));
        Ok(())
    }));
    unsafe {
        CreateCoreWebView2EnvironmentWithOptions(
            PCWSTR::null(),
            &HSTRING::from(folder.as_os_str()),
            None::<&ICoreWebView2EnvironmentOptions>,
            &handler,
        )
    }
    .map_err(com_error("init_failed"))?;
    let environment = pump_until(&env_rx)?.map_err(com_error("init_failed"))?;

    let (controller_tx, controller_rx) = mpsc::channel();
    let handler = CreateCoreWebView2ControllerCompletedHandler::create(Box::new(move |status, controller| {
        let _ = controller_tx.send(status.and(controller.ok_or_else(|| E_FAIL.into())));
        Ok(())
    }));
    unsafe { environment.CreateCoreWebView2Controller(hwnd, &handler) }.map_err(com_error("init_failed"))?;
    let controller = pump_until(&controller_rx)?.map_err(com_error("init_failed"))?;

    Ok((environment, controller))
}

fn pump_until<T>(rx: &mpsc::Receiver<T>) -> Result<T, EngineError> {
    let timer = unsafe { SetTimer(None, 0, INIT_TIMEOUT_MS, None) };
    let mut msg = MSG::default();
    let result = loop {
        if let Ok(value) = rx.try_recv() {
            break Ok(value);
        }
        if unsafe { GetMessageW(&mut msg, None, 0, 0) }.0 <= 0 {
            break Err(EngineError::new("init_failed", "message loop ended during WebView2 setup"));
        }
        if msg.message == WM_TIMER && msg.hwnd.is_invalid() && msg.wParam.0 == timer {
            break Err(EngineError::new("init_failed", "timed out waiting for WebView2"));
        }
        unsafe {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    };
    unsafe {
        let _ = KillTimer(None, timer);
    }
    result
}

fn add_message_handler(webview: &ICoreWebView2, on_message: MessageHandler) -> Result<i64, EngineError> {
    let handler = WebMessageReceivedEventHandler::create(Box::new(move |_sender, args| {
        let Some(args) = args else {
            return Ok(());
        };
        let mut message = PWSTR::null();
        unsafe { args.TryGetWebMessageAsString(&mut message)? };
        let raw = take_pwstr(message);
        catch_boundary("web message", || on_message(&raw));
        Ok(())
    }));
    let mut token = 0;
    unsafe { webview.add_WebMessageReceived(&handler, &mut token) }.map_err(com_error("init_failed"))?;
    Ok(token)
}

fn add_permission_handler(webview: &ICoreWebView2) -> Result<i64, EngineError> {
    let handler = PermissionRequestedEventHandler::create(Box::new(|_sender, args| {
        let Some(args) = args else {
            return Ok(());
        };
        let mut kind = COREWEBVIEW2_PERMISSION_KIND::default();
        unsafe { args.PermissionKind(&mut kind)? };
        if kind == COREWEBVIEW2_PERMISSION_KIND_CLIPBOARD_READ {
            unsafe { args.SetState(COREWEBVIEW2_PERMISSION_STATE_ALLOW)? };
        }
        Ok(())
    }));
    let mut token = 0;
    unsafe { webview.add_PermissionRequested(&handler, &mut token) }.map_err(com_error("init_failed"))?;
    Ok(token)
}

fn add_resource_handler(
    webview: &ICoreWebView2,
    environment: &ICoreWebView2Environment,
    home_uri: &str,
    pages: Rc<PageSource>,
) -> Result<i64, EngineError> {
    unsafe {
        webview.AddWebResourceRequestedFilter(
            &HSTRING::from(format!("{home_uri}*")),
            COREWEBVIEW2_WEB_RESOURCE_CONTEXT_ALL,
        )
    }
    .map_err(com_error("init_failed"))?;

    let environment = environment.clone();
    let handler = WebResourceRequestedEventHandler::create(Box::new(move |_sender, args| {
        let Some(args) = args else {
            return Ok(());
        };
        let mut uri = PWSTR::null();
        unsafe { args.Request()?.Uri(&mut uri)? };
        let uri = take_pwstr(uri);
        let outcome = catch_boundary("resource request", || pages.serve(&uri)).unwrap_or(FetchOutcome::Failed);
        let FetchOutcome::Response(response) = outcome else {
            return Err(E_FAIL.into());
        };
        let response = build_response(&environment, &response)?;
        unsafe { args.SetResponse(&response) }
    }));
    let mut token = 0;
    unsafe { webview.add_WebResourceRequested(&handler, &mut token) }.map_err(com_error("init_failed"))?;
    Ok(token)
}

fn build_response(
    environment: &ICoreWebView2Environment,
    response: &ResourceResponse,
) -> windows::core::Result<ICoreWebView2WebResourceResponse> {
    let stream = if response.body.is_empty() {
        None
    } else {
        Some(unsafe { SHCreateMemStream(Some(&response.body)) }.ok_or(windows::core::Error::from(E_FAIL))?)
    };
    unsafe {
        environment.CreateWebResourceResponse(
            stream.as_ref(),
            i32::from(response.status),
            &HSTRING::from(response.reason),
            &HSTRING::from(response.header_block()),
        )
    }
}

fn apply_settings(
    options: &Options,
    webview: &ICoreWebView2,
    controller: &ICoreWebView2Controller,
) -> Result<(), EngineError> {
    let settings = unsafe { webview.Settings() }.map_err(com_error("init_failed"))?;
    unsafe {
        let _ = settings.SetAreDevToolsEnabled(options.debug);
    }
    if let Some(agent) = options.user_agent() {
        match settings.cast::<ICoreWebView2Settings2>() {
            Ok(settings) => unsafe {
                let _ = settings.SetUserAgent(&HSTRING::from(agent));
            },
            Err(err) => log::warn!("custom user agent unsupported by this WebView2 runtime: {err}"),
        }
    }
    if options.transparent_background {
        if let Ok(controller) = controller.cast::<ICoreWebView2Controller2>() {
            let transparent = COREWEBVIEW2_COLOR { A: 0, R: 0, G: 0, B: 0 };
            unsafe {
                let _ = controller.SetDefaultBackgroundColor(transparent);
            }
        }
    }
    Ok(())
}
