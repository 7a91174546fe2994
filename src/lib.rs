//! `outcall` is a blocking outbound-HTTP client layer: a fluent request
//! builder that freezes into an immutable descriptor, and a
//! connection-pooled agent managing TLS trust modes, keep-alive, and a
//! transport retry policy.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use outcall::{AgentConfig, HttpAgent, RequestBuilder, TrustMode};
//!
//! fn main() -> outcall::Result<()> {
//!     let agent = HttpAgent::new(
//!         AgentConfig::new()
//!             .with_user_agent("inventory-sync")
//!             .with_retries(2)
//!             .with_max_connections_per_route(4)
//!             .with_read_timeout(Duration::from_secs(3)),
//!     )?;
//!
//!     let client = agent.acquire_client(TrustMode::None)?;
//!     let descriptor = RequestBuilder::get("http://api.internal/v1/items")
//!         .param("page", "1")
//!         .header("X-Request-Id", "sync-42")
//!         .build()?;
//!
//!     let response = client.execute(&descriptor)?;
//!     println!("{} {}", response.status(), response.text());
//!     Ok(())
//! }
//! ```
//!
//! One-shot calls skip the pool entirely:
//!
//! ```no_run
//! # fn main() -> outcall::Result<()> {
//! let body = outcall::RequestBuilder::get("http://api.internal/v1/ping")
//!     .send()?
//!     .text();
//! println!("{body}");
//! # Ok(())
//! # }
//! ```

mod agent;
mod config;
mod error;
pub mod json;
mod policy;
mod pool;
mod request;
mod response;
mod tls;
pub mod transfer;
mod transport;
mod util;

pub use crate::agent::{Client, HttpAgent};
pub use crate::config::AgentConfig;
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::policy::{RetryDecision, RetryPolicy};
pub use crate::request::{RequestBuilder, RequestDescriptor};
pub use crate::response::Response;
pub use crate::tls::TrustMode;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AgentConfig, Client, Error, HttpAgent, RequestBuilder, RequestDescriptor, Response,
        RetryPolicy, TrustMode,
    };
}
