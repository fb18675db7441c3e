//! Home-automation controller client
//!
//! Thin REST client for a Home Assistant compatible controller. The output
//! router and the internal playback tools are the only consumers; they need
//! service calls, entity state reads and area/media-player discovery.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HomeError {
    #[error("Controller request failed: {0}")]
    RequestFailed(String),
    #[error("Controller returned status {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse controller response: {0}")]
    ParseError(String),
}

/// Current state of a controller entity.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
}

/// A controller area (used for room import).
#[derive(Debug, Clone, Deserialize)]
pub struct HaArea {
    pub area_id: String,
    pub name: String,
}

/// Contract required of the home-automation controller.
#[async_trait]
pub trait HomeController: Send + Sync {
    /// Invoke a controller service, e.g. `media_player.play_media`.
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), HomeError>;

    /// Read the current state of an entity.
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HomeError>;

    /// List the controller's configured areas.
    async fn list_areas(&self) -> Result<Vec<HaArea>, HomeError>;

    /// List all media_player entities.
    async fn list_media_players(&self) -> Result<Vec<EntityState>, HomeError>;
}

/// REST client for a Home Assistant instance.
pub struct HomeAssistantClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HomeAssistantClient {
    pub fn new(config: &config::HomeAssistantConfig) -> Result<Self, HomeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HomeError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        tracing::info!(base_url = %config.base_url, "Home-automation client initialized");

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, HomeError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            Err(HomeError::ApiError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl HomeController for HomeAssistantClient {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), HomeError> {
        let mut body = data.unwrap_or_else(|| serde_json::json!({}));
        if let Value::Object(ref mut map) = body {
            map.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
        }

        let mut request = self
            .request(
                reqwest::Method::POST,
                &format!("/api/services/{domain}/{service}"),
            )
            .json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HomeError::RequestFailed(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HomeError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/states/{entity_id}"))
            .send()
            .await
            .map_err(|e| HomeError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check_response(response).await?;
        let state: EntityState = response
            .json()
            .await
            .map_err(|e| HomeError::ParseError(e.to_string()))?;
        Ok(Some(state))
    }

    async fn list_areas(&self) -> Result<Vec<HaArea>, HomeError> {
        let response = self
            .request(reqwest::Method::GET, "/api/areas")
            .send()
            .await
            .map_err(|e| HomeError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        response
            .json::<Vec<HaArea>>()
            .await
            .map_err(|e| HomeError::ParseError(e.to_string()))
    }

    async fn list_media_players(&self) -> Result<Vec<EntityState>, HomeError> {
        let response = self
            .request(reqwest::Method::GET, "/api/states")
            .send()
            .await
            .map_err(|e| HomeError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        let states: Vec<EntityState> = response
            .json()
            .await
            .map_err(|e| HomeError::ParseError(e.to_string()))?;

        Ok(states
            .into_iter()
            .filter(|s| s.entity_id.starts_with("media_player."))
            .collect())
    }
}
