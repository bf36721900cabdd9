use std::collections::BTreeMap;
use std::process::Command;

use serde::Deserialize;

use crate::collab::{ByteStream, ObjectStore};
use crate::config::{S3StoreConfig, resolve_env_ref, resolve_required_string_field, resolve_string_field};
use crate::error::{Error, Result};
use crate::process::{ChildReader, run_command_capture, run_with_stdin};
use crate::store::object_name;

/// Objects in one bucket, driven through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct S3Store {
    bucket: String,
    region: Option<String>,
    endpoint_url: Option<String>,
    profile: Option<String>,
    page_size: u32,
    command_env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPage {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

impl S3Store {
    pub fn new(cfg: &S3StoreConfig) -> Result<Self> {
        let bucket = resolve_required_string_field(
            "store.s3.bucket",
            Some(cfg.bucket.as_str()),
            cfg.bucket_env.as_deref(),
        )?;

        let mut command_env = BTreeMap::<String, String>::new();
        for (dst, src) in [
            ("AWS_ACCESS_KEY_ID", cfg.aws_access_key_id_env.as_deref()),
            ("AWS_SECRET_ACCESS_KEY", cfg.aws_secret_access_key_env.as_deref()),
            ("AWS_SESSION_TOKEN", cfg.aws_session_token_env.as_deref()),
        ] {
            if let Some(v) = resolve_env_ref(src) {
                command_env.insert(dst.to_string(), v);
            }
        }

        Ok(Self {
            bucket,
            region: resolve_string_field(cfg.region.as_deref(), cfg.region_env.as_deref()),
            endpoint_url: resolve_string_field(
                cfg.endpoint_url.as_deref(),
                cfg.endpoint_url_env.as_deref(),
            ),
            profile: resolve_string_field(cfg.profile.as_deref(), cfg.profile_env.as_deref()),
            page_size: cfg.page_size.max(1),
            command_env,
        })
    }

    fn aws(&self) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(profile) = self.profile.as_deref() {
            cmd.arg("--profile").arg(profile);
        }
        if let Some(region) = self.region.as_deref() {
            cmd.arg("--region").arg(region);
        }
        if let Some(endpoint) = self.endpoint_url.as_deref() {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        for (k, v) in &self.command_env {
            cmd.env(k, v);
        }
        cmd
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, object_name(key))
    }
}

fn parse_list_page(stdout: &[u8]) -> Result<ListPage> {
    // The CLI prints nothing at all for an empty result set.
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(ListPage::default());
    }
    serde_json::from_slice(stdout)
        .map_err(|e| Error::msg(format!("unexpected list-objects-v2 output: {e}")))
}

impl ObjectStore for S3Store {
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut cmd = self.aws();
            cmd.arg("s3api")
                .arg("list-objects-v2")
                .arg("--bucket")
                .arg(&self.bucket)
                .arg("--prefix")
                .arg(object_name(prefix))
                .arg("--max-items")
                .arg(self.page_size.to_string())
                .arg("--output")
                .arg("json");
            if let Some(t) = token.as_deref() {
                cmd.arg("--starting-token").arg(t);
            }
            let out = run_command_capture(cmd)
                .map_err(|e| Error::msg(format!("listing s3://{}/{prefix}: {e}", self.bucket)))?;
            let page = parse_list_page(&out.stdout)?;
            tracing::debug!(count = page.contents.len(), more = page.next_token.is_some(), "s3 list page");
            keys.extend(page.contents.into_iter().map(|o| o.key));
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }

    fn put_object(&self, key: &str, mut body: ByteStream) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg("-")
            .arg(self.url(key));
        run_with_stdin(cmd, &mut body)
    }

    fn get_object(&self, key: &str) -> Result<ByteStream> {
        let url = self.url(key);
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(&url)
            .arg("-");
        Ok(Box::new(ChildReader::spawn(cmd, format!("download {url}"))?))
    }
}
