use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use forq::handler::{HandlerRegistry, JobContext, JobHandler, PerformError};
use forq::store::Store;
use forq_config::{ForqSettings, load_settings};

pub async fn init_store(config: Option<&str>) -> Result<(ForqSettings, Store)> {
    let settings = load_settings(config)?;
    let store = Store::new(settings.clone()).await?;
    Ok((settings, store))
}

/// Smoke-test handler shipped with the binary: echoes its data to the job
/// output stream. Embedders register their own handlers through the library.
struct Echo;

#[async_trait]
impl JobHandler for Echo {
    async fn perform(&self, data: &Value, ctx: &mut JobContext<'_>) -> Result<(), PerformError> {
        let text = match data.get("say").and_then(Value::as_str) {
            Some(say) => say.to_string(),
            None => data.to_string(),
        };
        ctx.line(&text).await.map_err(PerformError::from)?;
        Ok(())
    }
}

pub fn default_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("Echo", Arc::new(Echo));
    Arc::new(registry)
}
