use anyhow::{bail, Result};
use std::{env, sync::Arc};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use water_client::{CacheStore, UsageReading};
use water_service::{
    config::AppConfig,
    observability,
    pipeline::{Retriever, UsagePipeline},
    sources,
    transform::UsageExtractor,
};

/// One-shot retrieval for checking the portal login by hand.
///
/// Ignores any cached reading. With `--store` the fresh reading also
/// replaces the cache entry the service serves from.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let mut store = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--store" => store = true,
            other => bail!("usage: fetch_usage [--store] (unexpected argument '{other}')"),
        }
    }

    let cfg = AppConfig::load()?;
    let retriever = sources::from_config(&cfg);
    let extractor = UsageExtractor::new(cfg.extractor.usage_columns.clone());

    let reading = if store {
        let cache = CacheStore::new(cfg.cache.path.clone(), cfg.cache.ttl());
        UsagePipeline::new(Arc::clone(&retriever), extractor, cache)
            .refresh()
            .await?
    } else {
        let payload = retriever.fetch().await?;
        let extracted = extractor.extract(&payload)?;
        UsageReading::captured_now(retriever.source_id(), extracted.value, extracted.row_count)
    };

    let captured_at = OffsetDateTime::from_unix_timestamp(reading.timestamp)?.format(&Rfc3339)?;
    tracing::info!(
        source = %reading.source,
        usage_gallons = reading.usage_value,
        captured_at = %captured_at,
        stored = store,
        "usage fetched"
    );
    println!("{}", serde_json::to_string_pretty(&reading)?);

    Ok(())
}
