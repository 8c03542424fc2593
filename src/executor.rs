use crate::surface::{Surface, SurfaceError, SurfaceInfo};
use tracing::{debug, warn};

const DEFAULT_WAIT_MS: u64 = 100;

/// A UI action proposed by the reasoning provider. Decoded once from the
/// wire, consumed exactly once by the executor.
#[derive(Clone, Debug)]
pub enum Action {
    Click { x: i64, y: i64, button: String },
    DoubleClick { x: i64, y: i64 },
    Scroll { x: i64, y: i64, scroll_x: i64, scroll_y: i64 },
    Type { text: String },
    Wait { ms: Option<u64> },
    Move { x: i64, y: i64 },
    Keypress { keys: Vec<String> },
    Drag { path: Vec<(i64, i64)> },
    Screenshot,
    Unknown(String),
}

/// Translates abstract actions into surface calls, applying bounds checks and
/// key-name normalization. Click and double-click are bounds checked; scroll,
/// move and drag are dispatched with whatever coordinates the provider sent.
pub struct Executor<S: Surface> {
    surface: S,
    info: SurfaceInfo,
}

impl<S: Surface> Executor<S> {
    pub fn new(surface: S) -> Self {
        let info = surface.info();
        Self { surface, info }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn info(&self) -> SurfaceInfo {
        self.info
    }

    fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.info.width) && y < i64::from(self.info.height)
    }

    /// Performs one action. Out-of-range clicks and degenerate drags are
    /// skipped silently, not reported as errors.
    pub async fn execute(&self, action: &Action) -> Result<(), SurfaceError> {
        match action {
            Action::Click { x, y, button } => {
                if !self.in_bounds(*x, *y) {
                    debug!(x, y, "click outside surface bounds, skipping");
                    return Ok(());
                }
                let button = if button == "wheel" { "middle" } else { button };
                self.surface.click(*x, *y, button).await
            }
            Action::DoubleClick { x, y } => {
                if !self.in_bounds(*x, *y) {
                    debug!(x, y, "double click outside surface bounds, skipping");
                    return Ok(());
                }
                self.surface.double_click(*x, *y).await
            }
            Action::Scroll { x, y, scroll_x, scroll_y } => {
                self.surface.scroll(*x, *y, *scroll_x, *scroll_y).await
            }
            Action::Type { text } => self.surface.type_text(text).await,
            Action::Wait { ms } => self.surface.wait(ms.unwrap_or(DEFAULT_WAIT_MS)).await,
            Action::Move { x, y } => self.surface.move_mouse(*x, *y).await,
            Action::Keypress { keys } => {
                let keys: Vec<String> = keys.iter().map(|k| normalize_key(k)).collect();
                // The surface only exposes a single press primitive, so the
                // down and up phases are two identical passes over the list.
                for key in &keys {
                    self.surface.key_press(key).await?;
                }
                for key in &keys {
                    self.surface.key_press(key).await?;
                }
                Ok(())
            }
            Action::Drag { path } => {
                if path.len() <= 1 {
                    debug!(points = path.len(), "drag path too short, skipping");
                    return Ok(());
                }
                self.surface.drag(path).await
            }
            // The next round's screenshot satisfies this request.
            Action::Screenshot => Ok(()),
            Action::Unknown(kind) => {
                warn!(action = %kind, "ignoring unknown action");
                Ok(())
            }
        }
    }
}

/// Lowercases a key name and rewrites the long arrow-key aliases to the short
/// names the surface understands.
fn normalize_key(key: &str) -> String {
    let key = key.to_lowercase();
    match key.as_str() {
        "arrowdown" => "down".to_string(),
        "arrowleft" => "left".to_string(),
        "arrowright" => "right".to_string(),
        "arrowup" => "up".to_string(),
        _ => key,
    }
}
