//! `reqwest` backed transport.
//!
//! Every pooled connection owns its own `reqwest::Client` limited to a single
//! keep-alive socket, so the connection pool decides how many sockets exist and
//! when they die. All clients of one transport share one cookie jar. Redirects
//! are never followed here; the materializer reports them.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::cookie::Jar;
use reqwest::{Client, Proxy};
use tracing::{debug, warn};
use url::Url;

use super::{Connection, RawResponse, Transport, TransportError};
use crate::config::{CookieEntry, FetchConfig, ProxyConfig};
use crate::fetch::{AccessKind, FetchRequest, Method};
use crate::pool::Route;

/// Client settings applied to every connection.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// User-Agent header value.
    pub user_agent: String,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Socket read timeout.
    pub read_timeout: Option<Duration>,
    /// Forward proxy for every scheme.
    pub proxy: Option<ProxyConfig>,
    /// Cookies seeded into the shared jar.
    pub cookies: Vec<CookieEntry>,
}

impl HttpSettings {
    /// Extracts client settings from a fetch configuration.
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: config.read_timeout_ms.map(Duration::from_millis),
            proxy: config.proxy.clone(),
            cookies: config.cookies.clone(),
        }
    }
}

/// Opens `reqwest` connections sharing one cookie jar.
#[derive(Debug)]
pub struct HttpTransport {
    settings: HttpSettings,
    jar: Arc<Jar>,
}

impl HttpTransport {
    /// Creates a transport and seeds its cookie jar.
    #[must_use]
    pub fn new(settings: HttpSettings) -> Self {
        let jar = Arc::new(Jar::default());
        for cookie in &settings.cookies {
            match Url::parse(&cookie.url) {
                Ok(url) => jar.add_cookie_str(&cookie.value, &url),
                Err(e) => warn!(url = %cookie.url, error = %e, "ignoring cookie with invalid URL"),
            }
        }
        Self { settings, jar }
    }

    /// The cookie jar shared by every connection.
    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    fn build_client(&self) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(1)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .cookie_provider(Arc::clone(&self.jar))
            .user_agent(self.settings.user_agent.as_str());
        if let Some(timeout) = self.settings.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.settings.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        // Explicit proxy only; system proxy discovery stays off.
        builder = match &self.settings.proxy {
            Some(proxy) => builder.proxy(Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?),
            None => builder.no_proxy(),
        };
        builder.build()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, route: &Route) -> Result<Box<dyn Connection>, TransportError> {
        let client = self
            .build_client()
            .map_err(|e| TransportError::new(AccessKind::Io, e))?;
        debug!(route = %route, "created HTTP connection");
        Ok(Box::new(HttpConnection {
            route: route.clone(),
            client: Some(client),
        }))
    }
}

/// One keep-alive socket's worth of `reqwest` client.
#[derive(Debug)]
struct HttpConnection {
    route: Route,
    client: Option<Client>,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&mut self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
        let Some(client) = self.client.as_ref() else {
            return Err(TransportError::msg(
                AccessKind::Socket,
                format!("connection to {} is closed", self.route),
            ));
        };

        let mut builder = match request.method() {
            Method::Get => client.get(request.url().clone()),
            Method::Head => client.head(request.url().clone()),
        };
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credential) = request.credential() {
            builder = builder.basic_auth(&credential.username, credential.password.as_deref());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        if request.method() == Method::Head {
            return Ok(RawResponse::without_body(status, headers));
        }
        let body = response.bytes_stream().map_err(classify);
        Ok(RawResponse::new(status, headers, Box::pin(body)))
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.client.take();
        Ok(())
    }
}

/// Maps a `reqwest` failure to an access kind.
fn classify(error: reqwest::Error) -> TransportError {
    let kind = if is_dns_failure(&error) {
        AccessKind::UnknownHost
    } else if let Some(io_kind) = io_error_kind(&error) {
        kind_for_io(io_kind, error.is_connect())
    } else if error.is_timeout() && error.is_connect() {
        AccessKind::ConnectTimeout
    } else if error.is_timeout() || error.is_connect() || error.is_body() || error.is_decode() {
        AccessKind::Socket
    } else {
        AccessKind::Io
    };
    TransportError::new(kind, error)
}

fn kind_for_io(kind: io::ErrorKind, connecting: bool) -> AccessKind {
    match kind {
        io::ErrorKind::ConnectionRefused => AccessKind::ConnectionRefused,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            AccessKind::NoRouteToHost
        }
        io::ErrorKind::TimedOut if connecting => AccessKind::ConnectTimeout,
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => AccessKind::Socket,
        _ => AccessKind::Io,
    }
}

fn io_error_kind(error: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        current = err.source();
    }
    None
}

fn is_dns_failure(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        current = err.source();
    }
    false
}
