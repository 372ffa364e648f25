use crate::error::ViewError;
use crate::resource::{FetchResource, Resource};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::sync::Arc;
use url::Url;

#[cfg(target_os = "windows")]
const DEFAULT_HOME_URI: &str = "https://webbridge.localhost/";
#[cfg(not(target_os = "windows"))]
const DEFAULT_HOME_URI: &str = "webbridge://webbridge.local/";

/// Settings for a new `WebView`. Everything except the resolver can also be
/// loaded from the environment or deserialized.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Devtools and console logging, where the engine supports them.
    pub debug: bool,
    /// Pop up a separate inspector window.
    pub debug_inspector: bool,
    /// macOS: let the first click on an unfocused view act as input.
    pub accepts_first_mouse_click: bool,
    /// Replaces the engine's user agent when non-empty.
    pub custom_user_agent: String,
    /// Home URI for resources served by `fetch_resource`, e.g.
    /// `foo://myapp.com`. Empty means the platform default.
    pub custom_scheme_uri: String,
    pub transparent_background: bool,
    /// macOS: route Cmd+C/X/V/Z/A to the standard app actions.
    pub default_clipboard_shortcuts: bool,
    #[serde(skip)]
    pub fetch_resource: Option<FetchResource>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            debug_inspector: false,
            accepts_first_mouse_click: false,
            custom_user_agent: String::new(),
            custom_scheme_uri: String::new(),
            transparent_background: false,
            default_clipboard_shortcuts: true,
            fetch_resource: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("debug", &self.debug)
            .field("debug_inspector", &self.debug_inspector)
            .field("accepts_first_mouse_click", &self.accepts_first_mouse_click)
            .field("custom_user_agent", &self.custom_user_agent)
            .field("custom_scheme_uri", &self.custom_scheme_uri)
            .field("transparent_background", &self.transparent_background)
            .field("default_clipboard_shortcuts", &self.default_clipboard_shortcuts)
            .field("fetch_resource", &self.fetch_resource.is_some())
            .finish()
    }
}

impl Options {
    /// Defaults overridden by `WEBBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.debug = env_bool("WEBBRIDGE_DEBUG");
        options.debug_inspector = env_bool("WEBBRIDGE_DEBUG_INSPECTOR");
        options.transparent_background = env_bool("WEBBRIDGE_TRANSPARENT");
        if let Some(agent) = env_string("WEBBRIDGE_USER_AGENT") {
            options.custom_user_agent = agent;
        }
        if let Some(uri) = env_string("WEBBRIDGE_SCHEME_URI") {
            options.custom_scheme_uri = uri;
        }
        options
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_debug_inspector(mut self, inspector: bool) -> Self {
        self.debug_inspector = inspector;
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.custom_user_agent = agent.into();
        self
    }

    pub fn with_scheme_uri(mut self, uri: impl Into<String>) -> Self {
        self.custom_scheme_uri = uri.into();
        self
    }

    pub fn with_transparent_background(mut self, transparent: bool) -> Self {
        self.transparent_background = transparent;
        self
    }

    pub fn with_first_mouse_click(mut self, accepts: bool) -> Self {
        self.accepts_first_mouse_click = accepts;
        self
    }

    pub fn with_clipboard_shortcuts(mut self, enabled: bool) -> Self {
        self.default_clipboard_shortcuts = enabled;
        self
    }

    pub fn with_resources<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<Resource> + Send + Sync + 'static,
    {
        self.fetch_resource = Some(Arc::new(resolver));
        self
    }

    pub fn user_agent(&self) -> Option<&str> {
        let agent = self.custom_user_agent.trim();
        (!agent.is_empty()).then_some(agent)
    }

    /// Where the view navigates when serving resources, always ending in `/`.
    pub fn home_uri(&self) -> Result<String, ViewError> {
        let custom = self.custom_scheme_uri.trim();
        if custom.is_empty() {
            return Ok(DEFAULT_HOME_URI.to_string());
        }
        let home = if custom.ends_with('/') {
            custom.to_string()
        } else {
            format!("{custom}/")
        };
        Url::parse(&home)
            .map_err(|err| ViewError::InvalidOptions(format!("custom_scheme_uri {home:?}: {err}")))?;
        Ok(home)
    }

    /// Scheme part of `home_uri`, e.g. `webbridge`.
    pub fn uri_scheme(&self) -> Result<String, ViewError> {
        let home = self.home_uri()?;
        match home.find(':') {
            Some(colon) if colon > 0 => Ok(home[..colon].to_string()),
            _ => Err(ViewError::InvalidOptions(format!(
                "custom_scheme_uri {home:?} has no scheme"
            ))),
        }
    }
}

fn env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}
