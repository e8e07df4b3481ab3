//! Lightweight health checks used for latency classification.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use url::Url;

/// A cheap backend check. Only success/failure and latency matter; any
/// payload is discarded.
pub trait Probe: Send + Sync {
  fn check(&self) -> BoxFuture<'_, Result<()>>;
}

impl<F, Fut> Probe for F
where
  F: Fn() -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send + 'static,
{
  fn check(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(self())
  }
}

/// Probe issuing `HEAD <url>`. Any response below 500 means the backend is reachable.
#[derive(Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: &str, timeout: Duration) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid probe URL {}: {}", url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;

    Ok(Self { client, url })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

impl Probe for HttpProbe {
  fn check(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      let response = self
        .client
        .head(self.url.clone())
        .send()
        .await
        .map_err(|e| eyre!("Probe request to {} failed: {}", self.url, e))?;

      let status = response.status();
      if status.is_server_error() {
        return Err(eyre!("Probe to {} returned {}", self.url, status));
      }

      Ok(())
    })
  }
}

impl std::fmt::Debug for HttpProbe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpProbe").field("url", &self.url.as_str()).finish()
  }
}
