//! Serving page resources from an application-supplied resolver.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use url::Url;

/// Raw content and MIME type of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl Resource {
    pub fn new(data: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Resolves a request path (starting at `/`) to a resource. Engines may call
/// it from any thread, possibly concurrently.
pub type FetchResource = Arc<dyn Fn(&str) -> Option<Resource> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResourceResponse {
    pub fn ok(resource: Resource) -> Self {
        let headers = vec![
            ("Content-Type".to_string(), resource.mime_type),
            ("Content-Length".to_string(), resource.data.len().to_string()),
            ("Cache-Control".to_string(), "no-store".to_string()),
            ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
        ];
        Self {
            status: 200,
            reason: "OK",
            headers,
            body: resource.data,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            reason: "Not Found",
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Headers joined as `Name: value` lines, the shape WebView2 expects.
    pub fn header_block(&self) -> String {
        self.headers
            .iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What an engine should answer for one intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Response(ResourceResponse),
    /// The resolver blew up. Engines turn this into their own generic
    /// request-failed signal.
    Failed,
}

#[derive(Clone)]
pub struct ResourceServer {
    resolver: FetchResource,
    user_agent: Option<String>,
}

impl fmt::Debug for ResourceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceServer")
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl ResourceServer {
    pub fn new(resolver: FetchResource) -> Self {
        Self {
            resolver,
            user_agent: None,
        }
    }

    /// Echo this user agent back as a response header on found resources.
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent.filter(|agent| !agent.is_empty());
        self
    }

    pub fn serve_path(&self, path: &str) -> FetchOutcome {
        let path = if path.is_empty() { "/" } else { path };
        let resolver = &self.resolver;
        match panic::catch_unwind(AssertUnwindSafe(|| resolver(path))) {
            Ok(Some(resource)) => {
                log::debug!("serving {path} ({} bytes, {})", resource.data.len(), resource.mime_type);
                let mut response = ResourceResponse::ok(resource);
                if let Some(agent) = &self.user_agent {
                    response.headers.push(("User-Agent".to_string(), agent.clone()));
                }
                FetchOutcome::Response(response)
            }
            Ok(None) => {
                log::debug!("no resource for {path}");
                FetchOutcome::Response(ResourceResponse::not_found())
            }
            Err(_) => {
                log::error!("resource resolver panicked for {path}");
                FetchOutcome::Failed
            }
        }
    }

    pub fn serve_uri(&self, uri: &str) -> FetchOutcome {
        match request_path(uri) {
            Some(path) => self.serve_path(&path),
            None => {
                log::warn!("unable to parse resource request uri: {uri}");
                FetchOutcome::Failed
            }
        }
    }
}

/// Path component of a request URI, `/` when the URI has none.
pub fn request_path(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri).ok()?;
    let path = parsed.path();
    if path.is_empty() {
        Some("/".to_string())
    } else {
        Some(path.to_string())
    }
}
