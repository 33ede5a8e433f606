//! Adapter for operator-style computer actions.
//!
//! Raw actions are objects tagged by `type` with flat coordinates, e.g.
//! `{"type": "click", "x": 10, "y": 20, "button": "left"}` or
//! `{"type": "keypress", "keys": ["CTRL", "L"]}`.

use super::Adapter;
use crate::action::{CanonicalAction, Key, MouseButton, Point};
use crate::error::{CoreError, Result};
use crate::observation::Resolution;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Wait applied when an operator `wait` carries no duration.
const DEFAULT_WAIT_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct Coord {
    x: i32,
    y: i32,
}

impl From<Coord> for Point {
    fn from(p: Coord) -> Self {
        Point::new(p.x, p.y)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OperatorAction {
    Click {
        x: i32,
        y: i32,
        #[serde(default = "left")]
        button: String,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Move {
        x: i32,
        y: i32,
    },
    Drag {
        path: Vec<Coord>,
    },
    Scroll {
        #[serde(default)]
        x: Option<i32>,
        #[serde(default)]
        y: Option<i32>,
        #[serde(default)]
        scroll_x: i32,
        #[serde(default)]
        scroll_y: i32,
    },
    Keypress {
        keys: Vec<String>,
    },
    Type {
        text: String,
    },
    Wait {
        #[serde(default)]
        ms: Option<u64>,
    },
    Screenshot,
}

fn left() -> String {
    "left".to_string()
}

fn mouse_button(name: &str) -> Result<MouseButton> {
    match name.to_ascii_lowercase().as_str() {
        "left" => Ok(MouseButton::Left),
        "right" => Ok(MouseButton::Right),
        "wheel" | "middle" => Ok(MouseButton::Middle),
        "back" => Ok(MouseButton::Back),
        "forward" => Ok(MouseButton::Forward),
        other => Err(CoreError::UnsupportedAction(format!(
            "unknown mouse button '{other}'"
        ))),
    }
}

/// Converts operator-style actions.
#[derive(Debug, Clone, Default)]
pub struct OperatorAdapter {
    resolution: Option<Resolution>,
}

impl OperatorAdapter {
    /// Adapter for an agent working in target space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter for an agent working at `resolution`.
    pub fn with_resolution(resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
        }
    }
}

impl Adapter for OperatorAdapter {
    type Raw = serde_json::Value;

    fn agent_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn convert(&self, raw: &serde_json::Value) -> Result<CanonicalAction> {
        let parsed: OperatorAction = serde_json::from_value(raw.clone()).map_err(|e| {
            CoreError::UnsupportedAction(format!("unrecognized operator action: {e}"))
        })?;

        let action = match parsed {
            OperatorAction::Click { x, y, button } => CanonicalAction::Click {
                point: Some(Point::new(x, y)),
                button: mouse_button(&button)?,
                count: 1,
                modifiers: BTreeSet::new(),
            },
            OperatorAction::DoubleClick { x, y } => CanonicalAction::Click {
                point: Some(Point::new(x, y)),
                button: MouseButton::Left,
                count: 2,
                modifiers: BTreeSet::new(),
            },
            OperatorAction::Move { x, y } => CanonicalAction::Move {
                point: Point::new(x, y),
            },
            OperatorAction::Drag { path } => CanonicalAction::Drag {
                path: path.into_iter().map(Point::from).collect(),
                button: MouseButton::Left,
                modifiers: BTreeSet::new(),
            },
            OperatorAction::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => CanonicalAction::Scroll {
                point: x.zip(y).map(|(x, y)| Point::new(x, y)),
                dx: scroll_x,
                dy: scroll_y,
                modifiers: BTreeSet::new(),
            },
            OperatorAction::Keypress { keys } => CanonicalAction::Press {
                keys: keys
                    .iter()
                    .map(|k| Key::parse(k).map_err(CoreError::from))
                    .collect::<Result<_>>()?,
            },
            OperatorAction::Type { text } => CanonicalAction::type_text(text),
            OperatorAction::Wait { ms } => CanonicalAction::Wait {
                duration_ms: ms.unwrap_or(DEFAULT_WAIT_MS),
            },
            OperatorAction::Screenshot => CanonicalAction::FetchState,
        };

        action.validate()?;
        Ok(action)
    }
}
