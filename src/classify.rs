//! Request classification: which caching policy serves a URL.

use reqwest::Url;

use crate::config::{SiteConfig, StaticScope};
use crate::error::Result;

/// Caching policy selected for a GET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Cache-first, filled into the static partition from same-origin 200s.
    Static,
    /// Cache-first, filled into the dynamic partition, placeholder when offline.
    ExternalImage,
    /// Network-first, filled into the dynamic partition, cache when offline.
    NetworkFirst,
}

impl Policy {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::ExternalImage => "external-image",
            Self::NetworkFirst => "network-first",
        }
    }
}

/// First-match-wins URL classifier built from a [`SiteConfig`].
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Url,
    root: String,
    index: String,
    static_extensions: Vec<String>,
    static_segments: Vec<String>,
    image_hosts: Vec<String>,
    image_extensions: Vec<String>,
    scope: StaticScope,
}

impl Classifier {
    /// Builds a classifier for the given site.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured origin is not a valid URL.
    pub fn new(config: &SiteConfig) -> Result<Self> {
        let origin = config.origin_url()?;
        let serialized = origin.origin().ascii_serialization();

        Ok(Self {
            root: format!("{serialized}/"),
            index: format!("{serialized}/index.html"),
            origin,
            static_extensions: config.static_extensions.clone(),
            static_segments: config.static_segments.clone(),
            image_hosts: config.image_hosts.clone(),
            image_extensions: config.image_extensions.clone(),
            scope: config.static_scope,
        })
    }

    /// Returns the policy for `url`. Rules are evaluated in order: static
    /// file, external image, then network-first.
    #[must_use]
    pub fn classify(&self, url: &Url) -> Policy {
        if self.is_static_file(url) {
            Policy::Static
        } else if self.is_external_image(url) {
            Policy::ExternalImage
        } else {
            Policy::NetworkFirst
        }
    }

    /// Returns true if `url` shares the site's origin.
    #[must_use]
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Static-file rule: a static extension or segment anywhere in the URL,
    /// or the site root / index page.
    #[must_use]
    pub fn is_static_file(&self, url: &Url) -> bool {
        if self.scope == StaticScope::SameOrigin && !self.is_same_origin(url) {
            return false;
        }
        let text = url.as_str();
        self.static_extensions.iter().any(|ext| text.contains(ext.as_str()))
            || self.static_segments.iter().any(|seg| text.contains(seg.as_str()))
            || text == self.root
            || text == self.index
    }

    /// External-image rule: an approved host, or an image extension anywhere
    /// in the URL.
    #[must_use]
    pub fn is_external_image(&self, url: &Url) -> bool {
        let approved = url
            .host_str()
            .is_some_and(|host| self.image_hosts.iter().any(|h| h == host));
        let text = url.as_str();
        approved || self.image_extensions.iter().any(|ext| text.contains(ext.as_str()))
    }
}
