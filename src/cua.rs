use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::executor::Action;
use crate::surface::SurfaceInfo;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Which Responses-API deployment to talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    OpenAi,
    Azure,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown endpoint '{other}', expected 'openai' or 'azure'")),
        }
    }
}

/// Provider credentials and routing, assembled by the caller. The client
/// itself never reads the process environment.
#[derive(Clone, Debug)]
pub struct CuaConfig {
    pub endpoint: Endpoint,
    pub api_base: String,
    pub api_key: String,
    /// Azure deployments require an api-version query parameter.
    pub api_version: String,
    pub model: String,
}

/// One computer call proposed by the model.
#[derive(Clone, Debug)]
pub struct ProposedCall {
    pub call_id: String,
    pub action: Action,
    /// Raw safety-check objects, echoed back verbatim on acknowledgment.
    pub safety_checks: Vec<Value>,
}

/// Parsed provider response for one round.
#[derive(Debug, Default)]
pub struct StepResponse {
    /// Raw output items, appended to the conversation as-is.
    pub items: Vec<Value>,
    pub calls: Vec<ProposedCall>,
    pub reasoning_summary: String,
    pub messages: Vec<String>,
}

/// Seam between the controller and the inference back-end.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn step(&self, conversation: &[Value], display: SurfaceInfo) -> Result<StepResponse>;
}

pub struct CuaClient {
    http: Client,
    cfg: CuaConfig,
}

impl CuaClient {
    pub fn new(cfg: CuaConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("api key missing for {:?} endpoint", cfg.endpoint);
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    fn request_url(&self) -> String {
        let base = self.cfg.api_base.trim_end_matches('/');
        match self.cfg.endpoint {
            Endpoint::OpenAi => format!("{base}/responses"),
            Endpoint::Azure => format!(
                "{base}/openai/responses?api-version={}",
                self.cfg.api_version
            ),
        }
    }

    fn build_request(&self, conversation: &[Value], display: SurfaceInfo) -> Value {
        json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "input": conversation,
            "reasoning": { "summary": "concise" },
            "tools": [{
                "type": "computer_use_preview",
                "display_width": display.width,
                "display_height": display.height,
                "environment": display.os.as_str(),
            }],
        })
    }

    /// Posts the request, retrying transport errors and 429/5xx responses
    /// with doubling backoff. Other client-side errors fail immediately.
    async fn post_with_retry(&self, body: &Value) -> Result<Value> {
        let url = self.request_url();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let req = self.http.post(&url);
            let req = match self.cfg.endpoint {
                Endpoint::OpenAi => req.bearer_auth(&self.cfg.api_key),
                Endpoint::Azure => req.header("api-key", &self.cfg.api_key),
            };
            match req.json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await?;
                    if status.is_success() {
                        return serde_json::from_str(&text)
                            .context("failed to parse provider response JSON");
                    }
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    if !retryable || attempt >= MAX_ATTEMPTS {
                        bail!("provider error {status}: {text}");
                    }
                    warn!(%status, attempt, "provider request failed, retrying");
                }
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err).context("provider request failed");
                    }
                    warn!(error = %err, attempt, "provider transport error, retrying");
                }
            }
            sleep(backoff).await;
            backoff *= 2;
        }
    }

    fn parse_step(v: Value) -> Result<StepResponse> {
        let items = v
            .get("output")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut step = StepResponse {
            items: items.clone(),
            ..Default::default()
        };
        let mut summaries: Vec<String> = Vec::new();

        for item in &items {
            match item.get("type").and_then(Value::as_str) {
                Some("reasoning") => {
                    if let Some(parts) = item.get("summary").and_then(Value::as_array) {
                        summaries.extend(
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(Value::as_str))
                                .map(str::to_string),
                        );
                    }
                }
                Some("message") => {
                    if let Some(parts) = item.get("content").and_then(Value::as_array) {
                        step.messages.extend(
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(Value::as_str))
                                .map(str::to_string),
                        );
                    }
                }
                Some("computer_call") => {
                    let call_id = item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .context("computer_call missing call_id")?
                        .to_string();
                    let action = item
                        .get("action")
                        .map(decode_action)
                        .context("computer_call missing action")?;
                    let safety_checks = item
                        .get("pending_safety_checks")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    step.calls.push(ProposedCall {
                        call_id,
                        action,
                        safety_checks,
                    });
                }
                other => debug!(kind = ?other, "skipping provider output item"),
            }
        }

        step.reasoning_summary = summaries.join("\n");
        Ok(step)
    }
}

#[async_trait]
impl Provider for CuaClient {
    async fn step(&self, conversation: &[Value], display: SurfaceInfo) -> Result<StepResponse> {
        let body = self.build_request(conversation, display);
        let v = self.post_with_retry(&body).await?;
        Self::parse_step(v)
    }
}

fn int(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

/// Decodes one wire action. Unknown kinds survive as `Action::Unknown` so the
/// executor can log and skip them instead of failing the round.
fn decode_action(v: &Value) -> Action {
    let kind = v.get("type").and_then(Value::as_str).unwrap_or("unknown");
    match kind {
        "click" => Action::Click {
            x: int(v, "x"),
            y: int(v, "y"),
            button: v
                .get("button")
                .and_then(Value::as_str)
                .unwrap_or("left")
                .to_string(),
        },
        "double_click" => Action::DoubleClick {
            x: int(v, "x"),
            y: int(v, "y"),
        },
        "scroll" => Action::Scroll {
            x: int(v, "x"),
            y: int(v, "y"),
            scroll_x: v
                .get("scroll_x")
                .or_else(|| v.get("dx"))
                .and_then(Value::as_i64)
                .unwrap_or(0),
            scroll_y: v
                .get("scroll_y")
                .or_else(|| v.get("dy"))
                .and_then(Value::as_i64)
                .unwrap_or(0),
        },
        "type" => Action::Type {
            text: v
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        "wait" | "wait_ms" => Action::Wait {
            ms: v.get("ms").and_then(Value::as_u64),
        },
        "move" => Action::Move {
            x: int(v, "x"),
            y: int(v, "y"),
        },
        "keypress" => Action::Keypress {
            keys: v
                .get("keys")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "drag" | "drag_path" => Action::Drag {
            path: v
                .get("path")
                .or_else(|| v.get("points"))
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            let x = p.get("x")?.as_i64()?;
                            let y = p.get("y")?.as_i64()?;
                            Some((x, y))
                        })
                        .collect()
                })
                .unwrap_or_default(),
        },
        "screenshot" => Action::Screenshot,
        other => Action::Unknown(other.to_string()),
    }
}
