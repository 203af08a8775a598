// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! PostgREST-style HTTP backend with an object storage bucket.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

use super::{RemoteError, RemoteStore};

/// Connection settings for [`RestRemote`].
#[derive(Clone)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
    /// Storage bucket for marker images.
    pub bucket: String,
    pub timeout: Duration,
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("url", &self.url)
            .field("bucket", &self.bucket)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// [`RemoteStore`] over `rest/v1` tables and `storage/v1` objects.
#[derive(Debug, Clone)]
pub struct RestRemote {
    config: RestConfig,
    client: Client,
}

impl RestRemote {
    pub fn new(config: RestConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Sync {
                table: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    fn base(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base(), table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    /// Public URL of an uploaded object.
    #[must_use]
    pub fn public_url(&self, filename: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base(),
            self.config.bucket,
            filename
        )
    }
}

async fn check(table: &str, response: Result<Response, reqwest::Error>) -> Result<Response, RemoteError> {
    let sync_error = |reason: String| RemoteError::Sync {
        table: table.to_string(),
        reason,
    };
    let response = response.map_err(|e| sync_error(e.to_string()))?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(sync_error(format!("HTTP {status}: {body}")))
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn upsert(&self, table: &str, record: Value, conflict_key: &str) -> Result<(), RemoteError> {
        debug!("Upserting into {} on {}", table, conflict_key);
        let request = self
            .authorized(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record]);
        check(table, request.send().await).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let request = self
            .authorized(self.client.delete(self.table_url(table)))
            .query(&[("id", format!("eq.{id}"))]);
        check(table, request.send().await).await?;
        Ok(())
    }

    async fn select(&self, table: &str, filter: Option<(&str, &str)>) -> Result<Vec<Value>, RemoteError> {
        let mut request = self
            .authorized(self.client.get(self.table_url(table)))
            .query(&[("select", "*")]);
        if let Some((column, value)) = filter {
            request = request.query(&[(column, format!("eq.{value}"))]);
        }
        let response = check(table, request.send().await).await?;
        response.json::<Vec<Value>>().await.map_err(|e| RemoteError::Sync {
            table: table.to_string(),
            reason: e.to_string(),
        })
    }

    async fn upload(&self, bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<String, RemoteError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base(),
            self.config.bucket,
            filename
        );
        let upload_error = |reason: String| RemoteError::Upload {
            filename: filename.to_string(),
            reason,
        };

        debug!("Uploading {} ({} bytes)", filename, bytes.len());
        let response = self
            .authorized(self.client.post(url))
            .header("Content-Type", content_type)
            .header("Cache-Control", "3600")
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(upload_error(format!("HTTP {status}: {body}")));
        }
        Ok(self.public_url(filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let remote = RestRemote::new(RestConfig {
            url: "https://demo.supabase.co/".to_string(),
            api_key: "secret".to_string(),
            bucket: "marker-images".to_string(),
            timeout: Duration::from_secs(10),
        })
        .unwrap();
        assert_eq!(remote.table_url("markers"), "https://demo.supabase.co/rest/v1/markers");
        assert_eq!(
            remote.public_url("m1_0_abc.jpg"),
            "https://demo.supabase.co/storage/v1/object/public/marker-images/m1_0_abc.jpg"
        );
        assert!(!format!("{:?}", remote.config).contains("secret"));
    }
}
