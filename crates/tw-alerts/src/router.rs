//! Order-router egress. The risk core only requests isolation and release;
//! the router decides how to enforce them.

use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use tw_types::{IsolationMethod, RouterConfig, RouterError, Target};

pub trait OrderRouter: Send {
    fn request_isolation(
        &mut self,
        action_id: Uuid,
        method: IsolationMethod,
        target: &Target,
        reason: &str,
    ) -> Result<(), RouterError>;

    fn request_release(&mut self, action_id: Uuid) -> Result<(), RouterError>;
}

/// Logs requests; for deployments where an operator relays them.
#[derive(Debug, Default)]
pub struct LogRouter;

impl OrderRouter for LogRouter {
    fn request_isolation(
        &mut self,
        action_id: Uuid,
        method: IsolationMethod,
        target: &Target,
        reason: &str,
    ) -> Result<(), RouterError> {
        warn!(%action_id, %method, %target, reason, "isolation requested");
        Ok(())
    }

    fn request_release(&mut self, action_id: Uuid) -> Result<(), RouterError> {
        info!(%action_id, "release requested");
        Ok(())
    }
}

/// JSON over HTTP: `POST {base}/isolations` and
/// `POST {base}/isolations/{id}/release`.
pub struct WebhookRouter {
    base: String,
    client: reqwest::blocking::Client,
}

impl WebhookRouter {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, RouterError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RouterError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn post(&self, url: String, body: serde_json::Value) -> Result<reqwest::StatusCode, RouterError> {
        self.client
            .post(url)
            .json(&body)
            .send()
            .map(|r| r.status())
            .map_err(|e| RouterError::Transport {
                message: e.to_string(),
            })
    }
}

impl OrderRouter for WebhookRouter {
    fn request_isolation(
        &mut self,
        action_id: Uuid,
        method: IsolationMethod,
        target: &Target,
        reason: &str,
    ) -> Result<(), RouterError> {
        let body = serde_json::json!({
            "action_id": action_id,
            "method": method,
            "target": target,
            "reason": reason,
        });
        let status = self.post(format!("{}/isolations", self.base), body)?;
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(RouterError::Rejected {
                reason: format!("router answered {}", status),
            })
        } else {
            Err(RouterError::Transport {
                message: format!("router answered {}", status),
            })
        }
    }

    fn request_release(&mut self, action_id: Uuid) -> Result<(), RouterError> {
        let url = format!("{}/isolations/{}/release", self.base, action_id);
        let status = self.post(url, serde_json::json!({ "action_id": action_id }))?;
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(RouterError::Unknown { action_id })
        } else {
            Err(RouterError::Transport {
                message: format!("router answered {}", status),
            })
        }
    }
}

pub fn build_router(config: &RouterConfig) -> Result<Box<dyn OrderRouter>, RouterError> {
    Ok(match config {
        RouterConfig::Log => Box::new(LogRouter),
        RouterConfig::Webhook { url, timeout_ms } => {
            Box::new(WebhookRouter::new(url, Duration::from_millis(*timeout_ms))?)
        }
    })
}
