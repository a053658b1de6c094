//! Minimal REST / N1QL client for checking what the admin commands did.
//! Ordinary data access belongs to a real SDK; this only covers what the tests assert on.

#![allow(dead_code)]

use color_eyre::eyre::{eyre, Result, WrapErr};
use dbcontainers_couchbase::CouchbaseContainer;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let _ = color_eyre::install();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct RestClient {
    http: reqwest::Client,
    rest_url: String,
    query_url: String,
    username: String,
    password: String,
}

impl RestClient {
    pub fn for_container(container: &CouchbaseContainer) -> Result<Self> {
        let identity = container.identity();
        Ok(Self {
            http: reqwest::Client::new(),
            rest_url: container.rest_url(),
            query_url: container
                .query_url()
                .ok_or_else(|| eyre!("query service port is not published"))?,
            username: identity.admin_username,
            password: identity.admin_password,
        })
    }

    pub async fn bucket_names(&self) -> Result<Vec<String>> {
        let buckets: Vec<Value> = self
            .http
            .get(format!("{}/pools/default/buckets", self.rest_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(buckets
            .iter()
            .filter_map(|b| b["name"].as_str().map(str::to_string))
            .collect())
    }

    /// Runs a N1QL statement with named parameters (`$name` keys in `params`).
    pub async fn query(&self, statement: &str, params: Value) -> Result<Vec<Value>> {
        let mut body = json!({ "statement": statement });
        if let (Some(body), Some(params)) = (body.as_object_mut(), params.as_object()) {
            for (key, value) in params {
                body.insert(format!("${key}"), value.clone());
            }
        }

        let response: Value = self
            .http
            .post(format!("{}/query/service", self.query_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?
            .json()
            .await
            .wrap_err("query service returned a non-JSON body")?;

        if response["status"] != "success" {
            return Err(eyre!("query `{statement}` failed: {}", response["errors"]));
        }
        Ok(response["results"].as_array().cloned().unwrap_or_default())
    }
}

/// Retries `check` until it returns `Ok(true)` or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = None;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => last_error = None,
            Err(e) => last_error = Some(e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(match last_error {
                Some(e) => e.wrap_err(format!("condition not met within {timeout:?}")),
                None => eyre!("condition not met within {timeout:?}"),
            });
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
