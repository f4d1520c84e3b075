use reqwest::{Client, Response};
use water_client::RawUsagePayload;

use crate::{
    config::{Credentials, SessionConfig},
    pipeline::{Retriever, UsageError},
    transform::normalize_usage_text,
};

use super::portal_html;

const USER_AGENT: &str = concat!("water-service/", env!("CARGO_PKG_VERSION"));

/// Logs into the server-rendered portal with a cookie-carrying HTTP session
/// and reads the usage figure straight off the usage page.
///
/// Each fetch builds its own client, so no cookies survive between fetches.
pub struct HttpSessionSource {
    cfg: SessionConfig,
    credentials: Option<Credentials>,
}

impl HttpSessionSource {
    pub fn new(cfg: SessionConfig, credentials: Option<Credentials>) -> Self {
        Self { cfg, credentials }
    }

    fn client(&self) -> Result<Client, UsageError> {
        Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(self.cfg.request_timeout())
            .build()
            .map_err(|e| {
                UsageError::Transport(format!("failed to build HTTP client: {e}"))
            })
    }

    async fn login(&self, client: &Client, creds: &Credentials) -> Result<(), UsageError> {
        let login_page = client.get(&self.cfg.login_url).send().await?;
        let login_page = body_of(login_page, "login page").await?;

        let token = portal_html::csrf_token(&login_page, &self.cfg.csrf_field)?
            .ok_or_else(|| {
                UsageError::Authentication(format!(
                    "login page has no '{}' token; page layout changed",
                    self.cfg.csrf_field
                ))
            })?;

        let form = [
            (self.cfg.email_field.as_str(), creds.email.as_str()),
            (self.cfg.password_field.as_str(), creds.password.as_str()),
            (self.cfg.csrf_field.as_str(), token.as_str()),
        ];
        let landing = body_of(
            client.post(&self.cfg.login_url).form(&form).send().await?,
            "login submit",
        )
        .await?;

        if !portal_html::has_logout_affordance(&landing, &self.cfg.logout_selector)? {
            return Err(UsageError::Authentication(
                "login failed: no logout link after submitting credentials".to_string(),
            ));
        }

        tracing::debug!("portal session authenticated");
        Ok(())
    }
}

async fn body_of(response: Response, step: &str) -> Result<String, UsageError> {
    let status = response.status();
    if !status.is_success() {
        return Err(UsageError::Status {
            step: step.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

#[async_trait::async_trait]
impl Retriever for HttpSessionSource {
    fn source_id(&self) -> &'static str {
        "ebmud_watersmart_session"
    }

    async fn fetch(&self) -> Result<RawUsagePayload, UsageError> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            UsageError::Config("EBMUD_EMAIL and EBMUD_PASSWORD must be set".to_string())
        })?;

        let client = self.client()?;
        self.login(&client, creds).await?;

        let usage_page = client.get(&self.cfg.usage_url).send().await?;
        let usage_page = body_of(usage_page, "usage page").await?;
        let text = portal_html::usage_element_text(&usage_page, &self.cfg.usage_selector)?
            .ok_or_else(|| {
                UsageError::Schema(format!(
                    "usage element not found ('{}')",
                    self.cfg.usage_selector
                ))
            })?;

        let normalized = normalize_usage_text(&text);
        tracing::debug!(raw = %text, normalized = %normalized, "usage element read");
        Ok(RawUsagePayload::Text(normalized))
    }
}
