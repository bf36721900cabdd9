use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::collab::{ByteStream, ObjectStore};
use crate::config::{HttpStoreConfig, resolve_required_string_field, resolve_string_field};
use crate::error::{Error, Result};
use crate::store::object_name;

/// Objects behind a plain HTTP endpoint: `PUT`/`GET <base>/<key>`, and
/// `GET <base>/?list=1&prefix=..` for listings.
pub struct HttpStore {
    base: String,
    token: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Keys(Vec<String>),
    Page {
        keys: Vec<String>,
        #[serde(default)]
        next: Option<String>,
    },
}

impl ListResponse {
    fn into_parts(self) -> (Vec<String>, Option<String>) {
        match self {
            Self::Keys(keys) => (keys, None),
            Self::Page { keys, next } => (keys, next.filter(|n| !n.is_empty())),
        }
    }
}

impl HttpStore {
    pub fn new(cfg: &HttpStoreConfig) -> Result<Self> {
        let base = resolve_required_string_field(
            "store.http.base_url",
            Some(cfg.base_url.as_str()),
            cfg.base_url_env.as_deref(),
        )?;
        let token = resolve_string_field(cfg.token.as_deref(), cfg.token_env.as_deref());
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base, object_name(key))
    }

    fn list_url(&self, prefix: &str, page: Option<&str>) -> Result<Url> {
        let mut params = vec![("list", "1"), ("prefix", object_name(prefix))];
        if let Some(p) = page {
            params.push(("page", p));
        }
        Url::parse_with_params(&format!("{}/", self.base), &params)
            .map_err(|e| Error::config(format!("invalid store.http.base_url '{}': {e}", self.base)))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

impl ObjectStore for HttpStore {
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let url = self.list_url(prefix, page.as_deref())?;
            let res = self
                .authed(self.client.get(url))
                .send()
                .map_err(|e| Error::msg(format!("HTTP list failed: {e}")))?;
            if res.status() == StatusCode::NOT_FOUND {
                break;
            }
            if !res.status().is_success() {
                return Err(Error::msg(format!(
                    "HTTP list failed with status {}",
                    res.status()
                )));
            }
            let body: ListResponse = res
                .json()
                .map_err(|e| Error::msg(format!("HTTP list returned unexpected body: {e}")))?;
            let (batch, next) = body.into_parts();
            keys.extend(batch);
            match next {
                Some(n) => page = Some(n),
                None => break,
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn put_object(&self, key: &str, body: ByteStream) -> Result<()> {
        let res = self
            .authed(self.client.put(self.object_url(key)))
            .body(Body::new(body))
            .send()
            .map_err(|e| Error::msg(format!("HTTP upload of {key} failed: {e}")))?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "HTTP upload of {key} failed with status {}",
            res.status()
        )))
    }

    fn get_object(&self, key: &str) -> Result<ByteStream> {
        let res = self
            .authed(self.client.get(self.object_url(key)))
            .send()
            .map_err(|e| Error::msg(format!("HTTP download of {key} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP download of {key} failed with status {}",
                res.status()
            )));
        }
        Ok(Box::new(res))
    }
}
