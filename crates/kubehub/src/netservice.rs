//! IP-pool source backed by the netservice HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use datawatch_core::IpPool;
use serde::Deserialize;
use tracing::warn;

use crate::{Source, SourceError};

#[derive(Debug, Deserialize)]
struct PoolResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Vec<IpPool>>,
}

/// Decode a `{code, message, data}` envelope; pools without a cluster inherit `cluster`.
pub fn parse_pools(body: &[u8], cluster: &str) -> Result<Vec<IpPool>, SourceError> {
    let resp: PoolResponse =
        serde_json::from_slice(body).map_err(|source| SourceError::Decode { path: "netservice pool".into(), source })?;
    if resp.code != 0 {
        return Err(SourceError::Remote { code: resp.code, message: resp.message });
    }
    Ok(resp
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|mut p| {
            if p.cluster.is_empty() {
                p.cluster = cluster.to_string();
            }
            p
        })
        .collect())
}

pub struct NetserviceSource {
    http: reqwest::Client,
    servers: Vec<String>,
    cluster: String,
}

impl NetserviceSource {
    pub fn new(servers: Vec<String>, cluster: &str) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, servers, cluster: cluster.to_string() })
    }

    fn url(&self, server: &str) -> String {
        format!("{}/v1/pool/{}?info=detail", server.trim_end_matches('/'), self.cluster)
    }

    async fn fetch(&self, server: &str) -> Result<Vec<IpPool>, SourceError> {
        let body = self.http.get(self.url(server)).send().await?.error_for_status()?.bytes().await?;
        parse_pools(&body, &self.cluster)
    }
}

#[async_trait]
impl Source<IpPool> for NetserviceSource {
    fn describe(&self) -> String { format!("netservice:{}", self.cluster) }

    /// Servers are tried in order; the last failure is returned when none answers.
    async fn list(&self) -> Result<Vec<IpPool>, SourceError> {
        let mut last = SourceError::NotReady;
        for server in &self.servers {
            match self.fetch(server).await {
                Ok(pools) => return Ok(pools),
                Err(e) => {
                    warn!(server = %server, error = %e, "netservice request failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}
