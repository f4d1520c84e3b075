use serde::Deserialize;
use std::{fmt, fs, path::PathBuf, time::Duration};

use water_client::store::{DEFAULT_CACHE_PATH, DEFAULT_TTL};

use crate::transform::DEFAULT_USAGE_COLUMNS;

/// WaterSmart CSV export; redirects to the CAS login when unauthenticated.
pub const DEFAULT_DOWNLOAD_URL: &str =
    "https://ebmud.watersmart.com/index.php/accountPreferences/download";

/// Portal account used to log in. Never logged or returned to clients.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CACHE_PATH),
            ttl_secs: DEFAULT_TTL.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverKind {
    /// Headless browser through the CAS login, then CSV download.
    Browser,
    /// Plain HTTP session against the server-rendered usage page.
    Session,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub download_url: String,
    /// Login is done once the browser is back on a host ending with this.
    pub portal_domain: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    pub login_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            portal_domain: "watersmart.com".to_string(),
            username_selector: r#"input[name="username"]"#.to_string(),
            password_selector: r#"input[name="password"]"#.to_string(),
            submit_selector: r#"button[type="submit"]"#.to_string(),
            login_timeout_secs: 60,
        }
    }
}

impl BrowserConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub login_url: String,
    pub usage_url: String,
    pub csrf_field: String,
    pub email_field: String,
    pub password_field: String,
    pub logout_selector: String,
    pub usage_selector: String,
    pub request_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_url: "https://ebmud.watersmart.com/index.php/welcome/login".to_string(),
            usage_url: "https://ebmud.watersmart.com/index.php/trackUsage".to_string(),
            csrf_field: "csrf_token".to_string(),
            email_field: "email".to_string(),
            password_field: "password".to_string(),
            logout_selector: r#"a[href*="logout"]"#.to_string(),
            usage_selector: ".usage-value".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub kind: RetrieverKind,
    pub browser: BrowserConfig,
    pub session: SessionConfig,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            kind: RetrieverKind::Browser,
            browser: BrowserConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub usage_columns: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            usage_columns: DEFAULT_USAGE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub retriever: RetrieverConfig,
    pub extractor: ExtractorConfig,
    pub metrics: Option<MetricsConfig>,
    /// Only ever taken from the environment.
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl AppConfig {
    /// Load `WATER_CONFIG` (default `water-config.toml`) if it exists, then
    /// apply `EBMUD_EMAIL`, `EBMUD_PASSWORD` and `PORT` from the environment.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("WATER_CONFIG").unwrap_or_else(|_| "water-config.toml".to_string());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(anyhow::anyhow!("failed to read config {path}: {e}")),
        };

        Self::from_sources(contents.as_deref(), |key| env::var(key).ok())
    }

    pub fn from_sources<F>(toml_contents: Option<&str>, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg: AppConfig = match toml_contents {
            Some(contents) => toml::from_str(contents)?,
            None => AppConfig::default(),
        };

        if let Some(port) = env("PORT") {
            cfg.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT '{port}': {e}"))?;
        }

        // Missing credentials are reported per fetch so /health keeps working.
        let email = env("EBMUD_EMAIL").filter(|v| !v.is_empty());
        let password = env("EBMUD_PASSWORD").filter(|v| !v.is_empty());
        cfg.credentials = match (email, password) {
            (Some(email), Some(password)) => Some(Credentials { email, password }),
            _ => None,
        };

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = AppConfig::from_sources(None, env_from(&[])).unwrap();

        assert_eq!(cfg.server.port, 8081);
        assert_eq!(cfg.server.bind_host, "127.0.0.1");
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(23 * 3600));
        assert_eq!(cfg.cache.path, PathBuf::from("/tmp/ebmud_cache.json"));
        assert_eq!(cfg.retriever.kind, RetrieverKind::Browser);
        assert_eq!(cfg.retriever.browser.login_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.extractor.usage_columns, vec!["Usage", "Usage (Gallons)", "Gallons"]);
        assert!(cfg.credentials.is_none());
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn env_supplies_credentials_and_port() {
        let cfg = AppConfig::from_sources(
            None,
            env_from(&[
                ("EBMUD_EMAIL", "me@example.com"),
                ("EBMUD_PASSWORD", "hunter2"),
                ("PORT", "9090"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.server.port, 9090);
        let creds = cfg.credentials.unwrap();
        assert_eq!(creds.email, "me@example.com");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn partial_credentials_are_treated_as_missing() {
        let cfg = AppConfig::from_sources(
            None,
            env_from(&[("EBMUD_EMAIL", "me@example.com"), ("EBMUD_PASSWORD", "")]),
        )
        .unwrap();

        assert!(cfg.credentials.is_none());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let res = AppConfig::from_sources(None, env_from(&[("PORT", "eighty")]));
        assert!(res.is_err());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let toml = r##"
            [server]
            port = 8200

            [cache]
            path = "/var/lib/water/cache.json"

            [retriever]
            kind = "session"

            [retriever.session]
            usage_selector = "#daily-usage"

            [metrics]
            bind_addr = "127.0.0.1:9100"
        "##;

        let cfg = AppConfig::from_sources(Some(toml), env_from(&[("PORT", "8300")])).unwrap();

        assert_eq!(cfg.server.port, 8300);
        assert_eq!(cfg.cache.path, PathBuf::from("/var/lib/water/cache.json"));
        assert_eq!(cfg.cache.ttl_secs, 23 * 3600);
        assert_eq!(cfg.retriever.kind, RetrieverKind::Session);
        assert_eq!(cfg.retriever.session.usage_selector, "#daily-usage");
        assert_eq!(cfg.retriever.session.csrf_field, "csrf_token");
        assert_eq!(cfg.metrics.unwrap().bind_addr, "127.0.0.1:9100");
    }

    #[test]
    fn example_config_parses() {
        let example = include_str!("../../water-config.example.toml");
        let cfg = AppConfig::from_sources(Some(example), env_from(&[])).unwrap();

        assert_eq!(cfg.retriever.kind, RetrieverKind::Browser);
        assert_eq!(cfg.retriever.browser.download_url, DEFAULT_DOWNLOAD_URL);
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            email: "me@example.com".to_string(),
            password: "hunter2".to_string(),
        };

        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("me@example.com"));
    }
}
