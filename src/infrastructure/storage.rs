use crate::config::{StorageBackend, StorageConfig};
use crate::services::storage::{S3StemStorage, StemStorage, SupabaseStemStorage};
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the configured object store. Misconfiguration disables uploads
/// instead of failing startup.
pub async fn setup_storage(config: &StorageConfig) -> Option<Arc<dyn StemStorage>> {
    match config.backend {
        StorageBackend::None => {
            info!("💾 Object storage disabled, stems stay on local disk");
            None
        }
        StorageBackend::S3 => setup_s3(config).await,
        StorageBackend::Supabase => setup_supabase(config),
    }
}

async fn setup_s3(config: &StorageConfig) -> Option<Arc<dyn StemStorage>> {
    let (Some(bucket), Some(access_key), Some(secret_key)) = (
        config.s3_bucket.clone(),
        config.s3_access_key.clone(),
        config.s3_secret_key.clone(),
    ) else {
        warn!("⚠️  STORAGE_BACKEND=s3 but S3_BUCKET/S3_ACCESS_KEY/S3_SECRET_KEY are not all set; uploads disabled");
        return None;
    };

    info!(
        "☁️  S3 Storage: {} (Bucket: {})",
        config.s3_endpoint.as_deref().unwrap_or("aws"),
        bucket
    );

    let mut loader = aws_config::from_env()
        .region(Region::new(config.s3_region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ));
    if let Some(endpoint) = &config.s3_endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.s3_endpoint.is_some())
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    let storage = S3StemStorage::new(
        client,
        bucket,
        config.prefix.clone(),
        config.s3_public_url.clone(),
    );
    warm_up(&storage).await;
    Some(Arc::new(storage))
}

fn setup_supabase(config: &StorageConfig) -> Option<Arc<dyn StemStorage>> {
    let (Some(url), Some(key)) = (config.supabase_url.as_deref(), config.supabase_key.clone())
    else {
        warn!("⚠️  STORAGE_BACKEND=supabase but SUPABASE_URL/SUPABASE_KEY are not set; uploads disabled");
        return None;
    };

    info!(
        "☁️  Supabase Storage: {} (Bucket: {})",
        url, config.supabase_bucket
    );

    match SupabaseStemStorage::new(
        url,
        key,
        config.supabase_bucket.clone(),
        config.prefix.clone(),
    ) {
        Ok(storage) => Some(Arc::new(storage)),
        Err(e) => {
            warn!("⚠️  Failed to create Supabase client: {}; uploads disabled", e);
            None
        }
    }
}

async fn warm_up(storage: &dyn StemStorage) {
    if storage.health_check().await {
        info!("✅ {} bucket reachable", storage.backend_name());
    } else {
        warn!(
            "⚠️  {} bucket unreachable! Uploads will be attempted and logged on failure.",
            storage.backend_name()
        );
    }
}
