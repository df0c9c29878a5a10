use crate::config::ServiceConfig;
use crate::services::separator::StemSeparator;
use std::sync::Arc;
use tracing::info;

pub async fn setup_separator(config: &ServiceConfig) -> Arc<dyn StemSeparator> {
    let separator = crate::services::separator::create_separator(config).await;

    info!(
        "🎛️  Separator: model={} device={} stems={:?}",
        separator.model_name(),
        separator.device(),
        separator.supported_stems()
    );

    // Check the model can be imported before the first request needs it
    if separator.health_check().await {
        info!("🧠 Separator ready");
    } else {
        tracing::warn!(
            "⚠️  Separator unavailable! Requests will fail until {} can import demucs.",
            config.demucs_python
        );
    }

    separator.into()
}
