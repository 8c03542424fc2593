use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("unsupported operating system: '{0}'")]
    UnsupportedOs(String),
    #[error("surface request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("surface protocol error: {0}")]
    Protocol(String),
}

/// OS family reported by the remote desktop. Anything outside this set is a
/// configuration error, raised before the first round runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Mac,
    Linux,
}

impl OsFamily {
    /// Resolves a `platform.system()`-style label ("Windows", "Darwin",
    /// "Linux") into an OS family.
    pub fn from_platform_label(label: &str) -> Result<Self, SurfaceError> {
        match label {
            "Windows" => Ok(Self::Windows),
            "Darwin" => Ok(Self::Mac),
            "Linux" => Ok(Self::Linux),
            other => Err(SurfaceError::UnsupportedOs(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Mac => "mac",
            Self::Linux => "linux",
        }
    }
}

/// Immutable descriptor of the remote surface, queried once at connect time.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    pub os: OsFamily,
}

/// Capabilities the driver needs from a remote computer. Implementations own
/// the transport; callers never see raw wire details.
#[async_trait]
pub trait Surface: Send + Sync {
    fn info(&self) -> SurfaceInfo;

    /// Captures the current screen as a base64-encoded PNG.
    async fn screenshot(&self) -> Result<String, SurfaceError>;

    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), SurfaceError>;
    async fn double_click(&self, x: i64, y: i64) -> Result<(), SurfaceError>;
    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), SurfaceError>;
    async fn type_text(&self, text: &str) -> Result<(), SurfaceError>;
    async fn wait(&self, ms: u64) -> Result<(), SurfaceError>;
    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), SurfaceError>;
    async fn key_press(&self, key: &str) -> Result<(), SurfaceError>;
    async fn drag(&self, path: &[(i64, i64)]) -> Result<(), SurfaceError>;
}

#[derive(Clone, Debug)]
pub struct SurfaceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Platform label of the remote machine, e.g. "Darwin".
    pub os_label: String,
}

#[derive(Deserialize)]
struct Dimensions {
    width: u32,
    height: u32,
}

/// HTTP-backed surface: screenshots via GET, input injection via a single
/// POST endpoint taking tagged action bodies.
pub struct RemoteSurface {
    http: Client,
    base: String,
    api_key: Option<String>,
    info: SurfaceInfo,
}

impl RemoteSurface {
    pub async fn connect(cfg: SurfaceConfig) -> Result<Self, SurfaceError> {
        let os = OsFamily::from_platform_label(&cfg.os_label)?;
        let http = Client::new();
        let base = cfg.base_url.trim_end_matches('/').to_string();
        let mut req = http.get(format!("{base}/dimensions"));
        if let Some(key) = &cfg.api_key {
            req = req.bearer_auth(key);
        }
        let dims: Dimensions = req.send().await?.error_for_status()?.json().await?;
        debug!(width = dims.width, height = dims.height, os = os.as_str(), "surface connected");
        Ok(Self {
            http,
            base,
            api_key: cfg.api_key,
            info: SurfaceInfo {
                width: dims.width,
                height: dims.height,
                os,
            },
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn dispatch(&self, body: Value) -> Result<(), SurfaceError> {
        let resp = self
            .authed(self.http.post(format!("{}/action", self.base)))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SurfaceError::Protocol(format!(
                "action {} rejected with {}",
                body.get("type").and_then(Value::as_str).unwrap_or("?"),
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Surface for RemoteSurface {
    fn info(&self) -> SurfaceInfo {
        self.info
    }

    async fn screenshot(&self) -> Result<String, SurfaceError> {
        let resp = self
            .authed(self.http.get(format!("{}/screenshot", self.base)))
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        Ok(B64.encode(bytes))
    }

    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "click", "x": x, "y": y, "button": button}))
            .await
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "double_click", "x": x, "y": y}))
            .await
    }

    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "scroll", "x": x, "y": y, "scroll_x": dx, "scroll_y": dy}))
            .await
    }

    async fn type_text(&self, text: &str) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "type", "text": text})).await
    }

    async fn wait(&self, ms: u64) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "wait", "ms": ms})).await
    }

    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "move", "x": x, "y": y})).await
    }

    async fn key_press(&self, key: &str) -> Result<(), SurfaceError> {
        self.dispatch(json!({"type": "keypress", "key": key})).await
    }

    async fn drag(&self, path: &[(i64, i64)]) -> Result<(), SurfaceError> {
        let points: Vec<Value> = path.iter().map(|&(x, y)| json!({"x": x, "y": y})).collect();
        self.dispatch(json!({"type": "drag", "path": points})).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_labels_resolve() {
        assert_eq!(OsFamily::from_platform_label("Windows").unwrap(), OsFamily::Windows);
        assert_eq!(OsFamily::from_platform_label("Darwin").unwrap(), OsFamily::Mac);
        assert_eq!(OsFamily::from_platform_label("Linux").unwrap(), OsFamily::Linux);
    }

    #[test]
    fn unknown_platform_is_fatal() {
        let err = OsFamily::from_platform_label("Plan9").unwrap_err();
        assert!(matches!(err, SurfaceError::UnsupportedOs(ref s) if s == "Plan9"));
    }
}
