//! The fetch handler: classify a request and run its policy's steps.

use std::sync::Arc;

use reqwest::Url;

use crate::classify::{Classifier, Policy};
use crate::config::SiteConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseKind};
use crate::network::{HttpNetwork, Network};
use crate::storage::{CacheKey, CacheStorage, DiskStorage};

/// Partition a network response may be stored into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Static,
    Dynamic,
}

/// Where a network response is copied after a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    pub partition: Partition,
    /// Only store same-origin (`Basic`) responses.
    pub same_origin_only: bool,
}

/// One attempt at producing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Serve a cached response from any partition.
    Cache,
    /// Fetch from the network; a 200 is copied into the fill partition.
    Network(Fill),
    /// Serve the offline image placeholder.
    Placeholder,
}

const STATIC_STEPS: &[Step] = &[
    Step::Cache,
    Step::Network(Fill {
        partition: Partition::Static,
        same_origin_only: true,
    }),
    Step::Cache,
];

const EXTERNAL_IMAGE_STEPS: &[Step] = &[
    Step::Cache,
    Step::Network(Fill {
        partition: Partition::Dynamic,
        same_origin_only: false,
    }),
    Step::Placeholder,
];

const NETWORK_FIRST_STEPS: &[Step] = &[
    Step::Network(Fill {
        partition: Partition::Dynamic,
        same_origin_only: false,
    }),
    Step::Cache,
];

impl Policy {
    /// Ordered steps tried for this policy.
    #[must_use]
    pub const fn steps(self) -> &'static [Step] {
        match self {
            Self::Static => STATIC_STEPS,
            Self::ExternalImage => EXTERNAL_IMAGE_STEPS,
            Self::NetworkFirst => NETWORK_FIRST_STEPS,
        }
    }
}

/// What produced a served response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
    Placeholder,
}

/// Result of handling a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The router did not intercept; the request goes to the network as is.
    Bypass,
    /// The router produced a response.
    Respond {
        response: Response,
        source: Source,
        policy: Policy,
    },
    /// Every step declined. The page sees a failed fetch, not a crash.
    Failed { error: Error, policy: Policy },
}

impl FetchOutcome {
    /// Returns the response, if one was produced.
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Respond { response, .. } => Some(response),
            Self::Bypass | Self::Failed { .. } => None,
        }
    }

    /// Returns the response source, if one was produced.
    #[must_use]
    pub const fn source(&self) -> Option<Source> {
        match self {
            Self::Respond { source, .. } => Some(*source),
            Self::Bypass | Self::Failed { .. } => None,
        }
    }

    /// Returns true if the router declined to intercept.
    #[must_use]
    pub const fn is_bypass(&self) -> bool {
        matches!(self, Self::Bypass)
    }
}

enum StepResult {
    Done(Response, Source),
    Next,
}

/// Escapes text for use inside SVG markup.
fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Per-request cache router.
pub struct CacheRouter<S: CacheStorage = DiskStorage, N: Network = HttpNetwork> {
    config: Arc<SiteConfig>,
    classifier: Classifier,
    scope: Url,
    storage: Arc<S>,
    network: Arc<N>,
}

impl<S: CacheStorage, N: Network> CacheRouter<S, N> {
    /// Creates a router for a site.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(config: SiteConfig, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::new(&config)?;
        let scope = config.scope_url()?;
        Ok(Self {
            config: Arc::new(config),
            classifier,
            scope,
            storage,
            network,
        })
    }

    /// Returns the site configuration.
    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Returns the classifier.
    #[must_use]
    pub const fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Returns the cache storage.
    #[must_use]
    pub const fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Returns the network.
    #[must_use]
    pub const fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Returns the scope URL this router controls.
    #[must_use]
    pub const fn scope(&self) -> &Url {
        &self.scope
    }

    /// Returns true if `url` lies inside the scope.
    #[must_use]
    pub fn in_scope(&self, url: &Url) -> bool {
        // Foreign URLs requested by in-scope pages are still intercepted; the
        // scope only limits which same-origin paths are controlled.
        !self.classifier.is_same_origin(url) || url.path().starts_with(self.scope.path())
    }

    fn partition_name(&self, partition: Partition) -> &str {
        match partition {
            Partition::Static => &self.config.partitions.static_assets,
            Partition::Dynamic => &self.config.partitions.dynamic,
        }
    }

    /// Builds the offline placeholder image.
    #[must_use]
    pub fn placeholder(&self) -> Response {
        let p = &self.config.placeholder;
        let svg = format!(
            r#"<svg width="{w}" height="{h}" xmlns="http://www.w3.org/2000/svg"><rect width="100%" height="100%" fill="{bg}"/><text x="50%" y="50%" text-anchor="middle" dy=".3em" fill="{fg}">{caption}</text></svg>"#,
            w = p.width,
            h = p.height,
            bg = escape_xml(&p.background),
            fg = escape_xml(&p.text_color),
            caption = escape_xml(&p.caption),
        );
        Response::new(200, svg).with_header("Content-Type", "image/svg+xml")
    }

    /// Handles a fetch event.
    ///
    /// Non-GET and out-of-scope requests are bypassed. Everything else is
    /// classified and the policy's steps run in order until one produces a
    /// response.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let Some(key) = CacheKey::for_request(request) else {
            return FetchOutcome::Bypass;
        };
        if !self.in_scope(&request.url) {
            return FetchOutcome::Bypass;
        }

        let policy = self.classifier.classify(&request.url);
        log::debug!("{} {} -> {}", request.method, request.url, policy.as_str());

        let mut last_error = None;
        for step in policy.steps() {
            match self.run_step(*step, request, &key, &mut last_error).await {
                StepResult::Done(response, source) => {
                    return FetchOutcome::Respond {
                        response,
                        source,
                        policy,
                    };
                }
                StepResult::Next => {}
            }
        }

        let error = last_error.unwrap_or_else(|| Error::Network {
            url: request.url.to_string(),
            reason: "no cached response".to_string(),
        });
        log::warn!("No response for {}: {error}", request.url);
        FetchOutcome::Failed { error, policy }
    }

    async fn run_step(
        &self,
        step: Step,
        request: &Request,
        key: &CacheKey,
        last_error: &mut Option<Error>,
    ) -> StepResult {
        match step {
            Step::Cache => match self.storage.lookup_any(key).await {
                Ok(Some(stored)) => {
                    log::debug!("Serving from cache: {key}");
                    StepResult::Done(stored.response, Source::Cache)
                }
                Ok(None) => StepResult::Next,
                Err(e) => {
                    log::warn!("Cache lookup failed for {key}: {e}");
                    StepResult::Next
                }
            },
            Step::Network(fill) => match self.network.fetch(request).await {
                Ok(response) => {
                    self.fill(fill, key, &response).await;
                    StepResult::Done(response, Source::Network)
                }
                Err(e) => {
                    log::debug!("Network failed for {key}: {e}");
                    *last_error = Some(e);
                    StepResult::Next
                }
            },
            Step::Placeholder => {
                log::debug!("Serving placeholder for {key}");
                StepResult::Done(self.placeholder(), Source::Placeholder)
            }
        }
    }

    /// Copies a fetched response into the fill partition when it qualifies.
    /// Store failures are logged; the caller still gets the response.
    async fn fill(&self, fill: Fill, key: &CacheKey, response: &Response) {
        if response.status != 200 {
            return;
        }
        if fill.same_origin_only && response.kind != ResponseKind::Basic {
            return;
        }
        let partition = self.partition_name(fill.partition);
        match self.storage.put(partition, key, response).await {
            Ok(()) => log::debug!("Stored {key} in {partition}"),
            Err(e) => log::warn!("Failed to store {key} in {partition}: {e}"),
        }
    }
}
