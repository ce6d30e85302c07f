//! HTTP object storage client.
//!
//! Talks to a hosted storage API with Supabase-style object endpoints:
//! `POST /storage/v1/object/{bucket}/{path}` to upload,
//! `GET /storage/v1/object/list/{bucket}?prefix=` to list and
//! `DELETE /storage/v1/object/{bucket}` with a prefix list to remove.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ObjectStore, RemoteObject, StorageError};

#[derive(Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, bucket: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Serialize)]
struct RemoveRequest {
    prefixes: Vec<String>,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StorageError::Status {
        status: status.as_u16(),
        body,
    })
}

impl ObjectStore for HttpObjectStore {
    fn put(
        &self,
        path: String,
        bytes: Vec<u8>,
        content_type: &'static str,
    ) -> BoxFuture<'static, Result<String, StorageError>> {
        let client = self.client.clone();
        let url = self.object_url(&path);
        Box::pin(async move {
            let resp = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes)
                .send()
                .await?;
            check_status(resp).await?;
            // The in-bucket path doubles as the stored reference, so
            // later `remove` calls can use it verbatim.
            Ok(path)
        })
    }

    fn list(&self, prefix: String) -> BoxFuture<'static, Result<Vec<RemoteObject>, StorageError>> {
        let client = self.client.clone();
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        Box::pin(async move {
            let resp = client.get(&url).query(&[("prefix", prefix.as_str())]).send().await?;
            let resp = check_status(resp).await?;
            let listed: Vec<ListedObject> = resp.json().await?;
            Ok(listed
                .into_iter()
                .map(|o| RemoteObject {
                    path: o.name,
                    timestamp: o.created_at,
                    size: o.size,
                })
                .collect())
        })
    }

    fn remove(&self, paths: Vec<String>) -> BoxFuture<'static, Result<(), StorageError>> {
        let client = self.client.clone();
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        Box::pin(async move {
            let resp = client
                .delete(&url)
                .json(&RemoveRequest { prefixes: paths })
                .send()
                .await?;
            check_status(resp).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_shape() {
        let store = HttpObjectStore::new("http://localhost:8000/", "user-captures");
        assert_eq!(
            store.object_url("u1/screenshot/2024-03-01T10:00:00Z"),
            "http://localhost:8000/storage/v1/object/user-captures/u1/screenshot/2024-03-01T10:00:00Z"
        );
    }

    #[test]
    fn test_listing_deserializes_partial_fields() {
        let listed: Vec<ListedObject> =
            serde_json::from_str(r#"[{"name": "u1/screenshot/x"}]"#).unwrap();
        assert_eq!(listed[0].name, "u1/screenshot/x");
        assert_eq!(listed[0].size, 0);
        assert!(listed[0].created_at.is_none());
    }
}
