//! Configuration types for the cache router, storage and host server.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Names of the cache partitions owned by the current worker version.
///
/// Partition names embed the version string, so bumping the version and
/// activating the new worker sweeps every partition of the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionNames {
    /// Primary partition name. Reported by `GET_VERSION`, kept only so that
    /// activation does not delete it.
    pub primary: String,
    /// Partition holding the static asset list and same-origin static files.
    pub static_assets: String,
    /// Partition holding external images and network-first responses.
    pub dynamic: String,
}

impl Default for PartitionNames {
    fn default() -> Self {
        Self::for_version("daniel-baylon", "v1.0.0")
    }
}

impl PartitionNames {
    /// Builds the three partition names for a site prefix and version.
    #[must_use]
    pub fn for_version(prefix: &str, version: &str) -> Self {
        Self {
            primary: format!("{prefix}-portfolio-{version}"),
            static_assets: format!("{prefix}-static-{version}"),
            dynamic: format!("{prefix}-dynamic-{version}"),
        }
    }

    /// Returns true if `name` is one of the current partitions.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        name == self.primary || name == self.static_assets || name == self.dynamic
    }
}

/// Which URLs the static-file rule is allowed to match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaticScope {
    /// Match any URL, local or foreign. Foreign image URLs are then always
    /// static, which leaves the image-extension clause of the external-image
    /// rule unreachable.
    #[default]
    AnyOrigin,
    /// Match same-origin URLs only. Foreign image URLs fall through to the
    /// external-image rule.
    SameOrigin,
}

/// Appearance of the synthesized image served when an external image is offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfig {
    pub width: u32,
    pub height: u32,
    pub background: String,
    pub text_color: String,
    pub caption: String,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 250,
            background: "#f0f0f0".to_string(),
            text_color: "#999".to_string(),
            caption: "Imagen no disponible".to_string(),
        }
    }
}

/// Content of notifications built from push payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification icon path.
    pub icon: String,
    /// Monochrome badge path.
    pub badge: String,
    /// Icon shown next to each action button.
    pub action_icon: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Title of the "explore" action.
    pub explore_title: String,
    /// Title of the "close" action.
    pub close_title: String,
    /// Path opened when the "explore" action is clicked.
    pub open_path: String,
    /// Background sync tag handled by the worker.
    pub sync_tag: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: format!("{ICON_PREFIX}-192x192.png"),
            badge: format!("{ICON_PREFIX}-64x64.png"),
            action_icon: format!("{ICON_PREFIX}-32x32.png"),
            vibrate: vec![200, 100, 200],
            explore_title: "Ver Portfolio".to_string(),
            close_title: "Cerrar".to_string(),
            open_path: "/".to_string(),
            sync_tag: "background-sync".to_string(),
        }
    }
}

const ICON_PREFIX: &str = "/img/Custom/Gemini_Generated_Image_ibcxssibcxssibcx";

const ICON_SIZES: [u32; 10] = [16, 32, 64, 96, 128, 192, 256, 384, 512, 1024];

fn default_static_assets() -> Vec<String> {
    let mut assets: Vec<String> = [
        "/",
        "/index.html",
        "/manifest.json",
        "/css/styles.css",
        "/js/script.js",
        "/js/main.js",
        "/js/counter.js",
        "/img/foto.jpeg",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    assets.extend(
        ICON_SIZES
            .iter()
            .map(|size| format!("{ICON_PREFIX}-{size}x{size}.png")),
    );
    assets.push(
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css".to_string(),
    );
    assets
}

fn default_external_urls() -> Vec<String> {
    [
        "https://images.unsplash.com/photo-1498050108023-c5249f4df085?w=600&h=400&fit=crop&auto=format",
        "https://images.unsplash.com/photo-1460925895917-afdab827c52f?w=400&h=250&fit=crop&auto=format",
        "https://images.unsplash.com/photo-1556742049-0cfed4f6a45d?w=400&h=250&fit=crop&auto=format",
        "https://images.unsplash.com/photo-1551288049-bebda4e38f71?w=400&h=250&fit=crop&auto=format",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Everything the router needs to know about one site.
///
/// Passed to the router at construction; nothing is read from global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Origin the site is served from, e.g. `https://example.org`.
    pub origin: String,
    /// Registration scope path, relative to the origin.
    pub base_path: String,
    /// Current partition names.
    pub partitions: PartitionNames,
    /// Paths and URLs that must be in the static partition after install.
    pub static_assets: Vec<String>,
    /// External image URLs pre-fetched into the dynamic partition at install.
    pub external_urls: Vec<String>,
    /// Hosts whose responses are treated as external images.
    pub image_hosts: Vec<String>,
    /// Substrings that mark a URL as a static file.
    pub static_extensions: Vec<String>,
    /// Path segments that mark a URL as a static file.
    pub static_segments: Vec<String>,
    /// Substrings that mark a URL as an image.
    pub image_extensions: Vec<String>,
    /// Which URLs the static rule may match.
    pub static_scope: StaticScope,
    pub placeholder: PlaceholderConfig,
    pub notifications: NotificationConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:8080".to_string(),
            base_path: "/".to_string(),
            partitions: PartitionNames::default(),
            static_assets: default_static_assets(),
            external_urls: default_external_urls(),
            image_hosts: strings(&["images.unsplash.com", "cdnjs.cloudflare.com"]),
            static_extensions: strings(&[
                ".html", ".css", ".js", ".json", ".png", ".jpg", ".jpeg", ".svg", ".ico",
            ]),
            static_segments: strings(&["/css/", "/js/", "/img/"]),
            image_extensions: strings(&[".jpg", ".jpeg", ".png", ".svg"]),
            static_scope: StaticScope::default(),
            placeholder: PlaceholderConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl SiteConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the site origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the registration scope path.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Sets the partition names.
    #[must_use]
    pub fn with_partitions(mut self, partitions: PartitionNames) -> Self {
        self.partitions = partitions;
        self
    }

    /// Sets the static asset list.
    #[must_use]
    pub fn with_static_assets(mut self, assets: Vec<String>) -> Self {
        self.static_assets = assets;
        self
    }

    /// Sets the external URL list.
    #[must_use]
    pub fn with_external_urls(mut self, urls: Vec<String>) -> Self {
        self.external_urls = urls;
        self
    }

    /// Sets which URLs the static rule may match.
    #[must_use]
    pub const fn with_static_scope(mut self, scope: StaticScope) -> Self {
        self.static_scope = scope;
        self
    }

    /// Parses the configured origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).map_err(|e| Error::InvalidUrl {
            url: self.origin.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolves a configured path or URL against the origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin or the entry cannot be parsed.
    pub fn resolve(&self, entry: &str) -> Result<Url> {
        self.origin_url()?.join(entry).map_err(|e| Error::InvalidUrl {
            url: entry.to_string(),
            reason: e.to_string(),
        })
    }

    /// Returns the absolute scope URL (origin joined with the base path).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin or base path is malformed.
    pub fn scope_url(&self) -> Result<Url> {
        self.resolve(&self.base_path)
    }

    /// Checks that the configuration can drive a router.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or [`Error::InvalidUrl`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let origin = self.origin_url()?;
        if origin.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "origin {} cannot be used as a base URL",
                self.origin
            )));
        }
        if !self.base_path.starts_with('/') {
            return Err(Error::Config(format!(
                "base_path must start with '/', got {:?}",
                self.base_path
            )));
        }
        let names = &self.partitions;
        if names.primary.is_empty() || names.static_assets.is_empty() || names.dynamic.is_empty()
        {
            return Err(Error::Config("partition names must not be empty".to_string()));
        }
        if names.static_assets == names.dynamic {
            return Err(Error::Config(
                "static and dynamic partitions must have distinct names".to_string(),
            ));
        }
        for entry in self.static_assets.iter().chain(&self.external_urls) {
            self.resolve(entry)?;
        }
        Ok(())
    }
}

/// Path configuration for the persistent cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory holding one subdirectory per cache partition.
    pub cache_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            cache_dir: cache_dir.join("folio-cache"),
        }
    }
}

/// Host server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Complete application configuration combining site, path and server settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Site and router configuration.
    pub site: SiteConfig,
    /// Path configuration.
    pub paths: PathConfig,
    /// Server configuration.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file. Missing sections and keys keep
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.site.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path` when given, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a given file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Writes the configuration as TOML (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
