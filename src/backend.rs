//! REST side of the backend: call registration, pull-mode call end and the
//! dashboard's call history.

use crate::error::{CallError, Result};
use crate::registration::{Caller, Registrar, Registration};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Reply to `GET /call/start`
#[derive(Debug, Deserialize)]
struct StartCallResponse {
    #[serde(default)]
    call_id: Option<Value>,
    #[serde(default)]
    client_id: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Reply to `GET /call/end`
#[derive(Debug, Deserialize)]
struct EndCallResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Lifecycle status of a stored call, as reported by the dashboard API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Resolved,
    Ended,
    Escalated,
    Active,
    Unknown,
}

impl CallStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "resolved" | "solved" => Self::Resolved,
            "ended" => Self::Ended,
            "escalated" => Self::Escalated,
            "active" => Self::Active,
            _ => Self::Unknown,
        }
    }
}

/// One row of the dashboard read model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(default)]
    pub call_id: Option<Value>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

impl CallRecord {
    pub fn status(&self) -> CallStatus {
        self.status.as_deref().map(CallStatus::parse).unwrap_or(CallStatus::Unknown)
    }

    pub fn call_id(&self) -> String {
        match &self.call_id {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// HTTP client for the call API and the dashboard API.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    dashboard_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, dashboard_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET /call/start?user_name=&phone_number=`
    pub async fn register(&self, caller: &Caller) -> Result<Registration> {
        let url = format!("{}/call/start", self.base_url);
        info!("📞 Registering caller {} at {}", caller.name(), url);

        let response = self
            .client
            .get(&url)
            .query(&[("user_name", caller.name()), ("phone_number", caller.phone())])
            .send()
            .await?;
        let body: StartCallResponse = response.json().await?;
        parse_registration(body)
    }

    /// `GET /call/end?call_id=` - pull-mode end, returns the call summary.
    pub async fn end_call(&self, call_id: &str) -> Result<Option<String>> {
        let url = format!("{}/call/end", self.base_url);
        let body: EndCallResponse = self
            .client
            .get(&url)
            .query(&[("call_id", call_id)])
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = body.error {
            return Err(CallError::BackendUnavailable(error));
        }
        Ok(body.summary)
    }

    /// `GET {dashboard}/api/calls`
    pub async fn list_calls(&self) -> Result<Vec<CallRecord>> {
        let url = format!("{}/api/calls", self.dashboard_url);
        debug!("Fetching call history from {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(CallError::BackendUnavailable(format!(
                "call history request failed with status {}",
                response.status()
            )));
        }
        let value: Value = response.json().await?;
        parse_call_list(value)
    }

    /// `GET {dashboard}/api/calls/{call_id}`; `None` when the call is unknown.
    pub async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let url = format!("{}/api/calls/{}", self.dashboard_url, call_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CallError::BackendUnavailable(format!(
                "call lookup failed with status {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl Registrar for BackendClient {
    async fn start_call(&self, caller: &Caller) -> Result<Registration> {
        self.register(caller).await
    }
}

fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_registration(body: StartCallResponse) -> Result<Registration> {
    if let Some(error) = body.error {
        warn!("Backend refused registration: {}", error);
        return Err(CallError::BackendUnavailable(error));
    }

    let session_id = id_string(body.call_id)
        .ok_or_else(|| CallError::BackendUnavailable("response is missing call_id".to_string()))?;
    // Older backends only return call_id.
    let client_id = id_string(body.client_id).unwrap_or_else(|| session_id.clone());

    Ok(Registration { session_id, client_id })
}

fn parse_call_list(value: Value) -> Result<Vec<CallRecord>> {
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        Value::Object(ref map) if map.contains_key("error") => Err(CallError::BackendUnavailable(
            map["error"].as_str().unwrap_or("unknown error").to_string(),
        )),
        other => Err(CallError::BackendUnavailable(format!(
            "unexpected call history payload: {}",
            other
        ))),
    }
}
