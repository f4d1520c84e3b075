pub mod browser_download;
pub mod http_session;
pub mod portal_html;
pub mod usage_csv;

pub use browser_download::BrowserDownloadSource;
pub use http_session::HttpSessionSource;

use std::sync::Arc;

use crate::{
    config::{AppConfig, RetrieverKind},
    pipeline::Retriever,
};

/// Build the one retriever this deployment is configured for.
pub fn from_config(cfg: &AppConfig) -> Arc<dyn Retriever> {
    match cfg.retriever.kind {
        RetrieverKind::Browser => Arc::new(BrowserDownloadSource::new(
            cfg.retriever.browser.clone(),
            cfg.credentials.clone(),
        )),
        RetrieverKind::Session => Arc::new(HttpSessionSource::new(
            cfg.retriever.session.clone(),
            cfg.credentials.clone(),
        )),
    }
}
