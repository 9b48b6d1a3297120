//! # Keel Runtime
//!
//! Boot and lifecycle layer of the Keel execution runtime.
//!
//! This crate provides:
//! - The boot builder ([`Keel::builder`]) running container, router,
//!   warm-up and pipeline assembly in a fixed order
//! - Transport mounting and shutdown ([`App`], [`Transport`])
//! - An in-process transport ([`LocalTransport`], [`LocalClient`])
//! - Layered configuration loading ([`ConfigLoader`])
//! - Logging setup ([`LoggingBuilder`])
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut app = Keel::builder()
//!         .config_loader(ConfigLoader::new().with_current_dir())
//!         .provide(|| Greeter)
//!         .route(Verb::GET, "/hello/:name", Greeter::hello)
//!         .build()?;
//!
//!     let (transport, client) = LocalTransport::new("local", 64);
//!     app.mount(transport);
//!
//!     let response = client.get("/hello/keel").await?;
//!     println!("{}", response.body_text());
//!
//!     app.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod transport;

pub use app::{App, Keel, KeelBuilder};
pub use config::{ConfigError, ConfigLoader, ConfigResult, KeelConfig, PipelineConfig};
pub use error::{BootError, BootResult, RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use transport::{LocalClient, LocalRequest, LocalTransport, Mount, Transport};

// Re-export tracing for use by applications
pub use tracing;
pub use tracing_subscriber;

/// Logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
