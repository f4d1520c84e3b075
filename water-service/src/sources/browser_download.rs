use std::time::Duration;

use fantoccini::{error::CmdError, Client, ClientBuilder, Locator};
use reqwest::header::COOKIE;
use water_client::RawUsagePayload;

use crate::{
    config::{BrowserConfig, Credentials},
    pipeline::{Retriever, UsageError},
};

use super::usage_csv::parse_usage_csv;

const REDIRECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives a headless browser through the CAS single sign-on in front of the
/// WaterSmart CSV export, then downloads the export with the browser's
/// session cookies.
///
/// Expects a WebDriver server (chromedriver, geckodriver) at
/// `webdriver_url`. One browser session per fetch, always closed afterwards.
pub struct BrowserDownloadSource {
    cfg: BrowserConfig,
    credentials: Option<Credentials>,
}

impl BrowserDownloadSource {
    pub fn new(cfg: BrowserConfig, credentials: Option<Credentials>) -> Self {
        Self { cfg, credentials }
    }

    async fn connect(&self) -> Result<Client, UsageError> {
        let mut caps = serde_json::Map::new();
        caps.insert(
            "goog:chromeOptions".to_string(),
            serde_json::json!({ "args": ["--headless=new", "--disable-gpu", "--no-sandbox"] }),
        );
        caps.insert(
            "moz:firefoxOptions".to_string(),
            serde_json::json!({ "args": ["-headless"] }),
        );

        let mut builder = ClientBuilder::native();
        builder.capabilities(caps);
        builder.connect(&self.cfg.webdriver_url).await.map_err(|e| {
            UsageError::Browser(format!(
                "could not start WebDriver session at {}: {e}",
                self.cfg.webdriver_url
            ))
        })
    }

    async fn run_session(
        &self,
        browser: &Client,
        creds: &Credentials,
    ) -> Result<RawUsagePayload, UsageError> {
        // Unauthenticated, the export redirects into the CAS login form.
        browser.goto(&self.cfg.download_url).await.map_err(browser_err)?;

        fill_field(browser, &self.cfg.username_selector, &creds.email).await?;
        fill_field(browser, &self.cfg.password_selector, &creds.password).await?;
        browser
            .find(Locator::Css(&self.cfg.submit_selector))
            .await
            .map_err(|e| missing_login_element(&self.cfg.submit_selector, e))?
            .click()
            .await
            .map_err(browser_err)?;

        self.wait_for_portal(browser).await?;
        tracing::debug!(portal = %self.cfg.portal_domain, "CAS login completed");

        let cookies = browser.get_all_cookies().await.map_err(browser_err)?;
        let cookie_header = (!cookies.is_empty()).then(|| {
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name(), c.value()))
                .collect::<Vec<_>>()
                .join("; ")
        });

        let bytes = self.download(cookie_header.as_deref()).await?;
        let rows = parse_usage_csv(&bytes)?;
        if rows.is_empty() {
            return Err(UsageError::EmptyResult("CSV contained no rows".to_string()));
        }

        tracing::debug!(rows = rows.len(), "usage export parsed");
        Ok(RawUsagePayload::Rows(rows))
    }

    async fn wait_for_portal(&self, browser: &Client) -> Result<(), UsageError> {
        let timeout = self.cfg.login_timeout();
        let poll = async {
            loop {
                let url = browser.current_url().await.map_err(browser_err)?;
                if host_is_portal(url.host_str(), &self.cfg.portal_domain) {
                    return Ok::<(), UsageError>(());
                }
                tokio::time::sleep(REDIRECT_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(UsageError::Authentication(format!(
                "no redirect back to {} within {}s; credentials rejected or SSO flow changed",
                self.cfg.portal_domain,
                timeout.as_secs()
            ))),
        }
    }

    /// Fetch the export over plain HTTP with the browser's session.
    /// WebDriver has no portable way to hand back a browser download.
    async fn download(&self, cookie_header: Option<&str>) -> Result<Vec<u8>, UsageError> {
        let client = reqwest::Client::builder()
            .timeout(self.cfg.login_timeout())
            .build()
            .map_err(|e| {
                UsageError::Transport(format!("failed to build HTTP client: {e}"))
            })?;

        let mut request = client.get(&self.cfg.download_url);
        if let Some(cookie_header) = cookie_header {
            request = request.header(COOKIE, cookie_header);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UsageError::Status {
                step: "usage export download".to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn browser_err(e: CmdError) -> UsageError {
    UsageError::Browser(e.to_string())
}

fn missing_login_element(selector: &str, e: CmdError) -> UsageError {
    UsageError::Authentication(format!("login form element '{selector}' not found: {e}"))
}

async fn fill_field(browser: &Client, selector: &str, value: &str) -> Result<(), UsageError> {
    let field = browser
        .find(Locator::Css(selector))
        .await
        .map_err(|e| missing_login_element(selector, e))?;
    // Autofill or a previous attempt may have left text in the field.
    field.clear().await.map_err(browser_err)?;
    field.send_keys(value).await.map_err(browser_err)
}

fn host_is_portal(host: Option<&str>, portal_domain: &str) -> bool {
    match host {
        Some(host) => host == portal_domain || host.ends_with(&format!(".{portal_domain}")),
        None => false,
    }
}

#[async_trait::async_trait]
impl Retriever for BrowserDownloadSource {
    fn source_id(&self) -> &'static str {
        "ebmud_watersmart_browser"
    }

    async fn fetch(&self) -> Result<RawUsagePayload, UsageError> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            UsageError::Config("EBMUD_EMAIL and EBMUD_PASSWORD must be set".to_string())
        })?;

        let browser = self.connect().await?;
        let result = self.run_session(&browser, creds).await;

        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "failed to close WebDriver session");
        }

        result
    }
}
