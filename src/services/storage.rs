use crate::models::Stem;
use anyhow::{Context, Result, anyhow, bail};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Best-effort remote copy of finished stems
#[async_trait::async_trait]
pub trait StemStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Uploads one stem file and returns its public URL
    async fn upload_stem(&self, job_id: Uuid, stem: Stem, path: &Path) -> Result<String>;

    /// Removes every object stored for the job
    async fn delete_job(&self, job_id: Uuid) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// Object key for a stem, e.g. `stems/<job_id>/vocals.wav`
pub fn object_key(prefix: &str, job_id: Uuid, stem: Stem) -> String {
    format!("{}{}/{}", prefix, job_id, stem.file_name())
}

fn job_prefix(prefix: &str, job_id: Uuid) -> String {
    format!("{}{}/", prefix, job_id)
}

/// S3-compatible object store (AWS, MinIO, R2, Supabase S3 gateway)
pub struct S3StemStorage {
    client: Client,
    bucket: String,
    prefix: String,
    public_url: Option<String>,
}

impl S3StemStorage {
    pub fn new(client: Client, bucket: String, prefix: String, public_url: Option<String>) -> Self {
        Self {
            client,
            bucket,
            prefix,
            public_url,
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("{}/{}", self.bucket, key),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await?;

            if let Some(contents) = res.contents {
                objects.extend(contents.into_iter().filter_map(|o| o.key));
            }

            if res.is_truncated.unwrap_or(false) {
                continuation_token = res.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(objects)
    }
}

#[async_trait::async_trait]
impl StemStorage for S3StemStorage {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn upload_stem(&self, job_id: Uuid, stem: Stem, path: &Path) -> Result<String> {
        let key = object_key(&self.prefix, job_id, stem);
        let body = ByteStream::from_path(path).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("audio/wav")
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("S3 put_object failed for {}: {:?}", key, e))?;

        Ok(self.public_url(&key))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        for key in self.list_objects(&job_prefix(&self.prefix, job_id)).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}

/// Supabase Storage over its REST API
pub struct SupabaseStemStorage {
    http: reqwest::Client,
    base_url: String,
    key: String,
    bucket: String,
    prefix: String,
}

#[derive(Deserialize)]
struct SupabaseObject {
    name: String,
}

impl SupabaseStemStorage {
    pub fn new(base_url: &str, key: String, bucket: String, prefix: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
            bucket,
            prefix,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.key).header("apikey", &self.key)
    }
}

#[async_trait::async_trait]
impl StemStorage for SupabaseStemStorage {
    fn backend_name(&self) -> &'static str {
        "supabase"
    }

    async fn upload_stem(&self, job_id: Uuid, stem: Stem, path: &Path) -> Result<String> {
        let key = object_key(&self.prefix, job_id, stem);
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata().await?.len();

        let res = self
            .authorized(self.http.post(self.object_url(&key)))
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header("x-upsert", "true")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            bail!("Supabase upload failed: {} - {}", status, text);
        }

        Ok(self.public_url(&key))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let folder = format!("{}{}", self.prefix, job_id);
        let list_url = format!(
            "{}/storage/v1/object/list/{}",
            self.base_url, self.bucket
        );

        let res = self
            .authorized(self.http.post(list_url))
            .json(&json!({ "prefix": folder, "limit": 100 }))
            .send()
            .await?;
        if !res.status().is_success() {
            bail!("Supabase list failed: {}", res.status());
        }

        let objects: Vec<SupabaseObject> = res.json().await?;
        if objects.is_empty() {
            return Ok(());
        }

        let prefixes: Vec<String> = objects
            .into_iter()
            .map(|o| format!("{}/{}", folder, o.name))
            .collect();

        let res = self
            .authorized(
                self.http
                    .delete(format!("{}/storage/v1/object/{}", self.base_url, self.bucket)),
            )
            .json(&json!({ "prefixes": prefixes }))
            .send()
            .await?;
        if !res.status().is_success() {
            bail!("Supabase delete failed: {}", res.status());
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/storage/v1/bucket/{}", self.base_url, self.bucket);
        matches!(
            self.authorized(self.http.get(url)).send().await,
            Ok(res) if res.status().is_success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        let id = Uuid::parse_str("6f1c1a52-0d2e-4a86-9a57-3b8a1c2f0e11").unwrap();
        assert_eq!(
            object_key("", id, Stem::Vocals),
            "6f1c1a52-0d2e-4a86-9a57-3b8a1c2f0e11/vocals.wav"
        );
        assert_eq!(
            object_key("stems/", id, Stem::Bass),
            "stems/6f1c1a52-0d2e-4a86-9a57-3b8a1c2f0e11/bass.wav"
        );
    }

    #[test]
    fn test_supabase_urls() {
        let storage = SupabaseStemStorage::new(
            "https://abc.supabase.co/",
            "anon".to_string(),
            "stems".to_string(),
            String::new(),
        )
        .unwrap();

        assert_eq!(
            storage.public_url("j/vocals.wav"),
            "https://abc.supabase.co/storage/v1/object/public/stems/j/vocals.wav"
        );
        assert_eq!(
            storage.object_url("j/vocals.wav"),
            "https://abc.supabase.co/storage/v1/object/stems/j/vocals.wav"
        );
    }
}
