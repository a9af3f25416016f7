//! folio-cache - An offline-first cache router for a portfolio site.
//!
//! The library intercepts the site's requests, decides per URL whether to
//! answer from the cache or the network, and manages versioned cache
//! partitions across worker updates. It is independent of any particular
//! host; the `server` feature adds an HTTP host built on axum.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use folio_cache::{
//!     CacheRouter, HttpNetwork, MemoryStorage, NoEvents, Registration, Request, ServiceWorker,
//!     SiteConfig,
//! };
//!
//! # async fn example() -> folio_cache::Result<()> {
//! let site = SiteConfig::new().with_origin("https://example.com");
//! let network = Arc::new(HttpNetwork::new(site.origin_url()?)?);
//! let scope = site.scope_url()?;
//! let router = CacheRouter::new(site, Arc::new(MemoryStorage::new()), network)?;
//!
//! // Install and activate the first worker
//! let registration = Registration::new(scope, Arc::new(NoEvents));
//! registration.register(Arc::new(ServiceWorker::new(router))).await?;
//!
//! // Route a request
//! let request = Request::parse_get("https://example.com/index.html")?;
//! let outcome = registration.handle_fetch(&request).await;
//! if let Some(response) = outcome.response() {
//!     println!("{} from {:?}", response.status, outcome.source());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod classify;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod messages;
pub mod network;
pub mod notify;
pub mod router;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use classify::{Classifier, Policy};
pub use config::{
    AppConfig, NotificationConfig, PartitionNames, PathConfig, PlaceholderConfig, ServerConfig,
    SiteConfig, StaticScope,
};
pub use error::{Error, Result};
pub use http::{Method, Request, Response, ResponseKind};
pub use lifecycle::{LifecycleEvents, NoEvents, Registration, ServiceWorker, WorkerState};
pub use messages::{Command, Reply};
pub use network::{HttpNetwork, Network};
pub use notify::{ClientAction, Notification};
pub use router::{CacheRouter, FetchOutcome, Source};
pub use storage::{CacheKey, CacheStorage, DiskStorage, MemoryStorage, StoredResponse};
