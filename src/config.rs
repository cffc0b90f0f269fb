use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Upstream origin that intercepted paths are resolved against
  pub origin: String,
  /// Address the HTTP host listens on
  pub listen: String,
  /// Prefix shared by every store name this agent owns
  pub cache_prefix: String,
  /// Build version; bumping it makes every older store stale
  pub version: String,
  /// Activate straight after install instead of holding in `waiting`
  pub skip_waiting: bool,
  /// Path prefixes treated as API-style requests
  pub api_prefixes: Vec<String>,
  /// File extensions treated as static assets (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// Resources loaded into the static store on install
  pub precache: Vec<String>,
  /// Cached page served to navigations when nothing else is available
  pub offline_page: String,
  /// Background-sync tag that triggers a precache refresh
  pub sync_tag: String,
  /// Title used for push notifications
  pub app_name: String,
  pub request_timeout_secs: u64,
  /// Database file (defaults to $XDG_DATA_HOME/stowaway/stores.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://127.0.0.1:8000".to_string(),
      listen: "127.0.0.1:8787".to_string(),
      cache_prefix: "stowaway".to_string(),
      version: "v1".to_string(),
      skip_waiting: true,
      api_prefixes: vec!["/api/".to_string()],
      static_extensions: [
        "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
        "ttf", "otf", "eot",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/static/css/main.css".to_string(),
        "/static/js/main.js".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      sync_tag: "background-sync".to_string(),
      app_name: "Stowaway".to_string(),
      request_timeout_secs: 30,
      database: None,
      log_dir: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stowaway.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stowaway/config.yaml
  ///
  /// Falls back to defaults when no file is found. `STOWAWAY_ORIGIN`
  /// overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("STOWAWAY_ORIGIN") {
      config.origin = origin;
    }

    config.origin_url()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stowaway.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stowaway").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parsed origin. Must be http(s) with no base path, since intercepted
  /// paths and precache entries are resolved from the origin root.
  pub fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    match url.scheme() {
      "http" | "https" => {}
      other => return Err(eyre!("Origin must be http or https, got '{}'", other)),
    }
    if url.path() != "/" {
      return Err(eyre!(
        "Origin must not have a path, got '{}' in '{}'",
        url.path(),
        self.origin
      ));
    }
    Ok(url)
  }

  /// Store holding precached and cache-first resources.
  pub fn static_store(&self) -> String {
    format!("{}-static-{}", self.cache_prefix, self.version)
  }

  /// Store holding network-first and revalidated responses.
  pub fn dynamic_store(&self) -> String {
    format!("{}-dynamic-{}", self.cache_prefix, self.version)
  }

  /// Store names that survive activation.
  pub fn whitelist(&self) -> Vec<String> {
    vec![self.static_store(), self.dynamic_store()]
  }

  /// Identifier reported to `GET_VERSION`.
  pub fn version_id(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  /// Resolve the database path, defaulting to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stowaway").join("stores.db"))
  }
}
