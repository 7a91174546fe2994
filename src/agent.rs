use std::sync::Arc;
use std::thread;
use std::time::Instant;

use native_tls::TlsConnector;
use tracing::{debug, error, info_span, warn};

use crate::config::AgentConfig;
use crate::error::{Error, TransportErrorKind};
use crate::policy::{KeepAlivePolicy, RetryDecision, RetryPolicy};
use crate::pool::{ConnectionPool, PoolLimits, Scheme};
use crate::request::{RequestBuilder, RequestDescriptor, WireOptions};
use crate::response::Response;
use crate::tls::{self, TrustMode};
use crate::transport::{self, ConnectOptions, Exchange};
use crate::util::redact_url_for_logs;

/// Connection-pooled client factory. Constructed once per process (or
/// per distinct configuration); the pool and its route caps are shared
/// by every client acquired from it, across threads.
pub struct HttpAgent {
    config: AgentConfig,
    retry_policy: RetryPolicy,
    keep_alive_policy: KeepAlivePolicy,
    pool: Arc<ConnectionPool>,
    proxy: Option<(String, u16)>,
}

impl HttpAgent {
    pub fn new(config: AgentConfig) -> crate::Result<Self> {
        config.validate()?;
        let proxy = config.parsed_proxy()?;
        let pool = ConnectionPool::new(PoolLimits {
            max_total: config.max_connections,
            max_per_route: config.max_connections_per_route,
            ttl: config.connection_ttl,
        });
        Ok(Self {
            retry_policy: RetryPolicy::with_retries(config.retries),
            keep_alive_policy: KeepAlivePolicy::new(config.keep_alive),
            pool,
            proxy,
            config,
        })
    }

    pub fn with_defaults() -> crate::Result<Self> {
        Self::new(AgentConfig::default())
    }

    /// Replaces the retry policy derived from the configured retry
    /// count with a customized one.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Times a pooled connection was reused instead of freshly
    /// connected. Stays at zero when reuse is disabled.
    pub fn reuse_count(&self) -> u64 {
        self.pool.reuse_count()
    }

    /// Builds a client bound to this agent's pool for the given trust
    /// mode. Mutual-TLS keystore problems surface here and are fatal
    /// for the requested client, never retried.
    pub fn acquire_client(&self, trust_mode: TrustMode) -> crate::Result<Client<'_>> {
        let connector = tls::build_connector(&trust_mode)?;
        Ok(Client {
            agent: self,
            trust_mode,
            connector,
        })
    }

    pub fn get(&self, url: &str) -> crate::Result<Response> {
        self.acquire_client(TrustMode::None)?
            .execute(&RequestBuilder::get(url).build()?)
    }

    pub fn post_body(&self, url: &str, body: &str) -> crate::Result<Response> {
        self.acquire_client(TrustMode::None)?
            .execute(&RequestBuilder::post(url).body(body).build()?)
    }

    pub fn post_form<K, V, I>(&self, url: &str, params: I) -> crate::Result<Response>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.acquire_client(TrustMode::None)?
            .execute(&RequestBuilder::post(url).params(params).build()?)
    }
}

/// A client bound to an agent's pool and a trust mode. Cheap to
/// acquire; holds no connection state of its own.
pub struct Client<'a> {
    agent: &'a HttpAgent,
    trust_mode: TrustMode,
    connector: TlsConnector,
}

impl Client<'_> {
    pub fn trust_mode(&self) -> &TrustMode {
        &self.trust_mode
    }

    /// Dispatches a descriptor over a pooled connection. Transport
    /// failures that are idempotent-safe are retried with a fresh lease
    /// per attempt, bounded by the retry policy; the response is
    /// returned for any status and non-success is logged at warn.
    pub fn execute(&self, descriptor: &RequestDescriptor) -> crate::Result<Response> {
        let config = &self.agent.config;
        let force_close = !config.reuse_enabled();
        let plan = descriptor.wire_plan(&WireOptions {
            user_agent: &config.user_agent,
            proxy_enabled: self.agent.proxy.is_some(),
            force_close,
        })?;
        let redacted = redact_url_for_logs(&descriptor.url);
        let retry_policy = &self.agent.retry_policy;
        let max_attempts = retry_policy.max_attempts();
        let started_at = Instant::now();

        let mut attempt = 1;
        loop {
            let span = info_span!(
                "outcall.request",
                method = %descriptor.method,
                url = %redacted,
                trust = self.trust_mode.as_str(),
                attempt,
                max_attempts,
            );
            let _enter = span.enter();
            debug!("dispatching request");

            let mut lease = self.agent.pool.lease(&plan.route, &self.trust_mode);
            let connected = match lease.take_connection() {
                Some(connection) => Ok(connection),
                None => transport::connect(
                    &plan.route,
                    &self.connector,
                    &ConnectOptions {
                        connect_timeout: config.connect_timeout,
                        read_timeout: config.read_timeout,
                        proxy: self.agent.proxy.as_ref().filter(|_| plan.route.scheme == Scheme::Http),
                    },
                    &descriptor.method,
                    &redacted,
                ),
            };

            let failure = match connected {
                Ok(mut connection) => {
                    match transport::exchange(
                        &mut connection,
                        &Exchange {
                            method: &descriptor.method,
                            url: &redacted,
                            target: &plan.target,
                            headers: &plan.headers,
                            body: plan.body.as_deref(),
                            read_timeout: config.read_timeout,
                            max_body_bytes: config.max_response_body_bytes,
                        },
                    ) {
                        Ok(raw) => {
                            let allowance = if raw.reusable && !force_close {
                                self.agent.keep_alive_policy.idle_allowance(&raw.headers)
                            } else {
                                None
                            };
                            let returned = if allowance.is_some() {
                                Some(connection)
                            } else {
                                None
                            };
                            lease.release(returned, allowance);

                            if raw.status.is_success() {
                                debug!(
                                    status = raw.status.as_u16(),
                                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                                    "request completed"
                                );
                            } else {
                                warn!(
                                    status = raw.status.as_u16(),
                                    "non-success response, returning body to caller"
                                );
                            }
                            return Ok(Response::new(
                                raw.status,
                                raw.headers,
                                raw.body,
                                descriptor.charset.clone(),
                            ));
                        }
                        Err(failure) => {
                            drop(lease);
                            failure
                        }
                    }
                }
                Err(failure) => {
                    drop(lease);
                    failure
                }
            };

            let decision = RetryDecision {
                attempt,
                max_attempts,
                method: descriptor.method.clone(),
                url: redacted.clone(),
                kind: failure.transport_kind(),
                timeout_phase: failure.timeout_phase(),
                response_started: response_started(&failure),
            };
            if retry_policy.should_retry(&decision) {
                let delay = retry_policy.backoff_for_retry(attempt);
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "retrying after transport failure"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
                continue;
            }

            error!(error = %failure, "request failed");
            return Err(failure);
        }
    }

    /// Terminal convenience: the decoded response body.
    pub fn execute_text(&self, descriptor: &RequestDescriptor) -> crate::Result<String> {
        Ok(self.execute(descriptor)?.text())
    }

    /// Terminal convenience: typed decode through the serialization
    /// glue. Transport failures are `Err`; a parse failure is `Ok(None)`.
    pub fn execute_json<T>(&self, descriptor: &RequestDescriptor) -> crate::Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        Ok(self.execute(descriptor)?.json())
    }
}

fn response_started(failure: &Error) -> bool {
    match failure {
        Error::Transport {
            kind,
            partial_status,
            ..
        } => *kind == TransportErrorKind::Interrupted || partial_status.is_some(),
        Error::Protocol { .. } => true,
        _ => false,
    }
}
