//! Gatekeep Library
//!
//! JWT authentication and authorization filter pipeline for request gateways.
//!
//! # Features
//!
//! - **Bearer Tokens**: HS256, RS256 and ES256 verification with issuer,
//!   audience and clock-skew checks
//! - **Form Login**: username/password against a static account directory
//! - **Route Policies**: Ant-style patterns mapped to authority requirements,
//!   first match wins, unmatched routes denied
//! - **Scoped Contexts**: per-request security context cleared on every exit
//!   path, including cancellation
//!
//! # Example
//!
//! ```no_run
//! use gatekeep::pipeline::WhoAmIHandler;
//! use gatekeep::request::InboundRequest;
//! use gatekeep::{Config, FilterPipeline};
//! use hyper::Method;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pipeline = FilterPipeline::from_config(&config, Arc::new(WhoAmIHandler))?;
//!
//!     let response = pipeline
//!         .handle(InboundRequest::new(Method::GET, "/api/me").with_bearer("eyJ..."))
//!         .await;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authz;
pub mod config;
pub mod context;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod router;

#[cfg(feature = "metrics")]
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use context::SecurityContext;
pub use pipeline::FilterPipeline;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
