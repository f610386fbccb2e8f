//! Readiness polling
//!
//! A spawned component has no channel back to the launcher, so readiness is established by
//! polling its status endpoint at a fixed interval for a bounded number of attempts.
//! Hub and node endpoints report readiness in different shapes; the shape is chosen per
//! component kind, never guessed from the response.

use async_trait::async_trait;
use localgrid_common::{ComponentKind, Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// How a status endpoint reports readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusShape {
    /// `GET /wd/hub/status` answering `{"status": 0, ...}`
    NodeStatusZero,
    /// `GET /grid/api/hub` answering `{"success": true, ...}`
    HubSuccess,
}

impl StatusShape {
    pub fn for_kind(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Hub => StatusShape::HubSuccess,
            _ => StatusShape::NodeStatusZero,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            StatusShape::NodeStatusZero => "/wd/hub/status",
            StatusShape::HubSuccess => "/grid/api/hub",
        }
    }

    /// Whether `body` says the component is ready
    pub fn is_ready(&self, body: &Value) -> bool {
        match self {
            StatusShape::NodeStatusZero => body.get("status").and_then(Value::as_i64) == Some(0),
            StatusShape::HubSuccess => body.get("success").and_then(Value::as_bool) == Some(true),
        }
    }
}

/// A component's status endpoint
#[derive(Debug, Clone)]
pub struct StatusEndpoint {
    pub component: String,
    pub host: String,
    pub port: u16,
    pub shape: StatusShape,
}

impl StatusEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.shape.path())
    }
}

/// HTTP access to managed components
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// GET `url` and parse the body as JSON
    async fn get_json(&self, url: &str) -> Result<Value>;

    /// POST to `url` with an empty body
    async fn post(&self, url: &str) -> Result<()>;
}

/// reqwest-backed client
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    client: reqwest::Client,
}

impl HttpStatusClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post(&self, url: &str) -> Result<()> {
        self.client.post(url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Bounded readiness polling
#[derive(Clone)]
pub struct ReadinessProbe {
    client: Arc<dyn StatusClient>,
}

impl ReadinessProbe {
    pub fn new(client: Arc<dyn StatusClient>) -> Self {
        Self { client }
    }

    pub fn http() -> Result<Self> {
        Ok(Self::new(Arc::new(HttpStatusClient::new()?)))
    }

    pub fn client(&self) -> &Arc<dyn StatusClient> {
        &self.client
    }

    /// One status check. Any failure, including connection refused, means "not up".
    pub async fn is_up(&self, endpoint: &StatusEndpoint) -> bool {
        let url = endpoint.url();
        match self.client.get_json(&url).await {
            Ok(body) => {
                let ready = endpoint.shape.is_ready(&body);
                debug!("{} status at {}: ready={}", endpoint.component, url, ready);
                ready
            }
            Err(e) => {
                debug!("{} not answering at {}: {}", endpoint.component, url, e);
                false
            }
        }
    }

    /// Sleep `interval`, then check, up to `max_attempts` times.
    ///
    /// Returns as soon as a check succeeds; exhausting the budget is a
    /// [`Error::ReadinessTimeout`] naming the component and port.
    pub async fn wait_until_up(
        &self,
        endpoint: &StatusEndpoint,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<()> {
        for attempt in 1..=max_attempts {
            sleep(interval).await;
            if self.is_up(endpoint).await {
                info!(
                    "{} is up on {}:{} after {} attempt(s)",
                    endpoint.component, endpoint.host, endpoint.port, attempt
                );
                return Ok(());
            }
        }

        let err = Error::ReadinessTimeout {
            component: endpoint.component.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            attempts: max_attempts,
        };
        error!("{}", err);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shapes_are_not_interchangeable() {
        let node_ready = json!({ "status": 0, "value": {} });
        let hub_ready = json!({ "success": true });

        assert!(StatusShape::NodeStatusZero.is_ready(&node_ready));
        assert!(!StatusShape::NodeStatusZero.is_ready(&hub_ready));
        assert!(StatusShape::HubSuccess.is_ready(&hub_ready));
        assert!(!StatusShape::HubSuccess.is_ready(&node_ready));
        assert!(!StatusShape::NodeStatusZero.is_ready(&json!({ "status": 13 })));
        assert!(!StatusShape::HubSuccess.is_ready(&json!({ "success": "true" })));
    }

    #[test]
    fn test_endpoint_url_per_kind() {
        let hub = StatusEndpoint {
            component: "hub".into(),
            host: "127.0.0.1".into(),
            port: 4444,
            shape: StatusShape::for_kind(ComponentKind::Hub),
        };
        assert_eq!(hub.url(), "http://127.0.0.1:4444/grid/api/hub");

        let node = StatusEndpoint {
            shape: StatusShape::for_kind(ComponentKind::SelendroidNode),
            ..hub
        };
        assert_eq!(node.url(), "http://127.0.0.1:4444/wd/hub/status");
    }
}
