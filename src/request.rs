use std::time::Duration;

use bytes::Bytes;
use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, warn};

use crate::config::{DEFAULT_MAX_RESPONSE_BODY_BYTES, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
use crate::error::Error;
use crate::pool::{Route, Scheme};
use crate::response::Response;
use crate::tls::TrustMode;
use crate::transport::{self, ConnectOptions, Exchange};
use crate::util::{append_params, form_encode, has_header, redact_url_for_logs};

/// Fluent configuration for a single HTTP call. Each setter consumes
/// and returns the builder; `build` freezes it into an immutable
/// [`RequestDescriptor`], preventing accidental mutation across
/// concurrent calls.
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    body: Option<Bytes>,
    trust_all: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    encode_params: bool,
    content_type: Option<String>,
    charset: Option<String>,
    accept: Option<String>,
    accept_gzip: bool,
}

impl RequestBuilder {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            params: Vec::new(),
            body: None,
            trust_all: false,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            encode_params: true,
            content_type: None,
            charset: None,
            accept: None,
            accept_gzip: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Adds a header. Names are kept exactly as given, in order; no
    /// case normalization is performed.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<K, V, I>(mut self, headers: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.headers
            .extend(headers.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.params
            .extend(params.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    /// Serializes a struct into parameters, for typed callers.
    pub fn params_of<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| Error::Config {
            message: format!("failed to serialize request params: {source}"),
        })?;
        self.params.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    /// Raw request body. On POST/PUT it is sent verbatim and takes
    /// precedence over `params`, which then move to the query string.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Bytes::from(body.into()));
        self
    }

    pub(crate) fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// One-way trust-all TLS for this call: accept self-signed and
    /// otherwise invalid certificates without hostname verification.
    /// For trusted internal endpoints only; never the default.
    pub fn trust_all(mut self) -> Self {
        self.trust_all = true;
        self
    }

    /// Percent-encoding of parameter values. Disable when values are
    /// already serialized in an agency-specific format. Encoded query
    /// strings use the form-urlencoded convention (space becomes `+`).
    pub fn encode_params(mut self, encode: bool) -> Self {
        self.encode_params = encode;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn accept_gzip(mut self, accept_gzip: bool) -> Self {
        self.accept_gzip = accept_gzip;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    /// Freezes the builder into an immutable descriptor.
    pub fn build(self) -> crate::Result<RequestDescriptor> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidUrl { url: self.url });
        }
        let parsed = url::Url::parse(&self.url).map_err(|_| Error::InvalidUrl {
            url: self.url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(Error::InvalidUrl { url: self.url });
        }

        Ok(RequestDescriptor {
            url: self.url,
            method: self.method,
            headers: self.headers,
            params: self.params,
            body: self.body,
            trust_all: self.trust_all,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            encode_params: self.encode_params,
            content_type: self.content_type,
            charset: self.charset,
            accept: self.accept,
            accept_gzip: self.accept_gzip,
        })
    }

    /// Builds and sends in one step over a fresh unpooled connection.
    pub fn send(self) -> crate::Result<Response> {
        self.build()?.send()
    }
}

/// Immutable description of a single HTTP call. Holds no connection
/// state; `send` may be re-invoked idempotently.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub(crate) url: String,
    pub(crate) method: Method,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) body: Option<Bytes>,
    pub(crate) trust_all: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) encode_params: bool,
    pub(crate) content_type: Option<String>,
    pub(crate) charset: Option<String>,
    pub(crate) accept: Option<String>,
    pub(crate) accept_gzip: bool,
}

pub(crate) struct WireOptions<'a> {
    pub(crate) user_agent: &'a str,
    /// Plain-HTTP calls through a forward proxy use the absolute-form
    /// request target.
    pub(crate) proxy_enabled: bool,
    pub(crate) force_close: bool,
}

pub(crate) struct WirePlan {
    pub(crate) route: Route,
    pub(crate) target: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Assembles the wire request: route, request target with encoded
    /// query, generated headers followed by caller headers exactly as
    /// provided, and the payload.
    ///
    /// GET and DELETE carry `params` in the query string. POST and PUT
    /// form-encode `params` into the body unless an explicit body was
    /// set, in which case the body is sent verbatim and `params` move
    /// to the query string.
    pub(crate) fn wire_plan(&self, options: &WireOptions<'_>) -> crate::Result<WirePlan> {
        let parsed = url::Url::parse(&self.url).map_err(|_| Error::InvalidUrl {
            url: self.url.clone(),
        })?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => {
                return Err(Error::InvalidUrl {
                    url: self.url.clone(),
                });
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidUrl {
                url: self.url.clone(),
            })?
            .to_owned();
        let port = parsed.port().unwrap_or(scheme.default_port());
        let route = Route {
            scheme,
            host: host.clone(),
            port,
        };

        let mut target = parsed.path().to_owned();
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }

        let is_form_method = matches!(self.method, Method::POST | Method::PUT);
        let mut form_body_generated = false;
        let body = if is_form_method {
            match &self.body {
                Some(explicit) => {
                    target = append_params(&target, &self.params, self.encode_params);
                    Some(explicit.clone())
                }
                None if !self.params.is_empty() => {
                    form_body_generated = true;
                    if self.encode_params {
                        Some(Bytes::from(form_encode(&self.params)))
                    } else {
                        let joined = self
                            .params
                            .iter()
                            .map(|(name, value)| format!("{name}={value}"))
                            .collect::<Vec<_>>()
                            .join("&");
                        Some(Bytes::from(joined))
                    }
                }
                None => None,
            }
        } else {
            target = append_params(&target, &self.params, self.encode_params);
            None
        };

        let mut headers = Vec::new();
        if !has_header(&self.headers, "host") {
            let host_value = match parsed.port() {
                Some(explicit_port) => format!("{host}:{explicit_port}"),
                None => host.clone(),
            };
            headers.push(("Host".to_owned(), host_value));
        }
        if !has_header(&self.headers, "user-agent") {
            headers.push(("User-Agent".to_owned(), options.user_agent.to_owned()));
        }
        if self.accept_gzip && !has_header(&self.headers, "accept-encoding") {
            headers.push(("Accept-Encoding".to_owned(), "gzip".to_owned()));
        }

        let charset = self.charset.as_deref().filter(|value| !value.is_empty());
        match self.content_type.as_deref().filter(|value| !value.is_empty()) {
            Some(content_type) if !has_header(&self.headers, "content-type") => {
                let value = match charset {
                    Some(charset) => format!("{content_type}; charset={charset}"),
                    None => content_type.to_owned(),
                };
                headers.push(("Content-Type".to_owned(), value));
            }
            None if form_body_generated && !has_header(&self.headers, "content-type") => {
                headers.push((
                    "Content-Type".to_owned(),
                    format!(
                        "application/x-www-form-urlencoded; charset={}",
                        charset.unwrap_or("UTF-8")
                    ),
                ));
            }
            _ => {}
        }

        if let Some(accept) = self.accept.as_deref().filter(|value| !value.is_empty())
            && !has_header(&self.headers, "accept")
        {
            headers.push(("Accept".to_owned(), accept.to_owned()));
        }
        if let Some(body) = &body {
            headers.push(("Content-Length".to_owned(), body.len().to_string()));
        }
        if options.force_close && !has_header(&self.headers, "connection") {
            headers.push(("Connection".to_owned(), "close".to_owned()));
        }
        headers.extend(self.headers.iter().cloned());

        let target = if options.proxy_enabled && route.scheme == Scheme::Http {
            match parsed.port() {
                Some(explicit_port) => format!("http://{host}:{explicit_port}{target}"),
                None => format!("http://{host}{target}"),
            }
        } else {
            target
        };

        Ok(WirePlan {
            route,
            target,
            headers,
            body,
        })
    }

    /// Performs the call on a fresh, unpooled connection that is closed
    /// afterwards. This path never retries; retry belongs to the pooled
    /// client path.
    pub fn send(&self) -> crate::Result<Response> {
        let trust = if self.trust_all {
            TrustMode::TrustAll
        } else {
            TrustMode::None
        };
        let connector = crate::tls::build_connector(&trust)?;
        let plan = self.wire_plan(&WireOptions {
            user_agent: DEFAULT_USER_AGENT,
            proxy_enabled: false,
            force_close: true,
        })?;
        let redacted = redact_url_for_logs(&self.url);

        let span = info_span!(
            "outcall.request",
            method = %self.method,
            url = %redacted,
            trust = trust.as_str(),
        );
        let _enter = span.enter();
        debug!("sending one-shot request");

        let mut connection = transport::connect(
            &plan.route,
            &connector,
            &ConnectOptions {
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                proxy: None,
            },
            &self.method,
            &redacted,
        )?;
        let raw = transport::exchange(
            &mut connection,
            &Exchange {
                method: &self.method,
                url: &redacted,
                target: &plan.target,
                headers: &plan.headers,
                body: plan.body.as_deref(),
                read_timeout: self.read_timeout,
                max_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            },
        )?;

        if !raw.status.is_success() {
            warn!(status = raw.status.as_u16(), "non-success response");
        } else {
            debug!(status = raw.status.as_u16(), "request completed");
        }
        Ok(Response::new(
            raw.status,
            raw.headers,
            raw.body,
            self.charset.clone(),
        ))
    }

    /// Terminal convenience: the decoded response body.
    pub fn send_text(&self) -> crate::Result<String> {
        Ok(self.send()?.text())
    }

    /// Terminal convenience: typed decode through the serialization
    /// glue. Transport failures are `Err`; a parse failure is `Ok(None)`.
    pub fn send_json<T>(&self) -> crate::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        Ok(self.send()?.json())
    }
}
