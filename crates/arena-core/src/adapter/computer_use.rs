//! Adapter for computer-use tool inputs.
//!
//! Raw actions look like `{"action": "left_click", "coordinate": [x, y]}`.
//! Key combinations use `+` separators (`"ctrl+shift+t"`).

use super::Adapter;
use crate::action::{CanonicalAction, Key, Modifier, MouseButton, Point};
use crate::error::{CoreError, Result};
use crate::observation::Resolution;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Pixels scrolled per unit of `scroll_amount`.
const SCROLL_STEP_PX: i32 = 100;

#[derive(Debug, Deserialize)]
struct ToolInput {
    action: String,
    #[serde(default)]
    coordinate: Option<[i32; 2]>,
    #[serde(default)]
    start_coordinate: Option<[i32; 2]>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    scroll_direction: Option<String>,
    #[serde(default)]
    scroll_amount: Option<u32>,
    /// Seconds
    #[serde(default)]
    duration: Option<f64>,
}

/// Converts computer-use tool inputs.
#[derive(Debug, Clone, Default)]
pub struct ComputerUseAdapter {
    resolution: Option<Resolution>,
}

impl ComputerUseAdapter {
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

fn point(coordinate: Option<[i32; 2]>) -> Option<Point> {
    coordinate.map(|[x, y]| Point::new(x, y))
}

fn parse_chord(text: &str) -> Result<Vec<Key>> {
    text.split('+')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Key::parse(part).map_err(CoreError::from))
        .collect()
}

fn parse_modifiers(text: Option<&str>) -> Result<BTreeSet<Modifier>> {
    let Some(text) = text else {
        return Ok(BTreeSet::new());
    };
    parse_chord(text)?
        .into_iter()
        .map(|key| match key {
            Key::Shift => Ok(Modifier::Shift),
            Key::Ctrl => Ok(Modifier::Ctrl),
            Key::Alt => Ok(Modifier::Alt),
            Key::Meta => Ok(Modifier::Meta),
            other => Err(CoreError::UnsupportedAction(format!(
                "'{other}' is not a modifier key"
            ))),
        })
        .collect()
}

fn click(input: &ToolInput, button: MouseButton, count: u8) -> Result<CanonicalAction> {
    Ok(CanonicalAction::Click {
        point: point(input.coordinate),
        button,
        count,
        modifiers: parse_modifiers(input.text.as_deref())?,
    })
}

fn required<'a, T>(value: &'a Option<T>, field: &str, action: &str) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| {
        CoreError::UnsupportedAction(format!("'{action}' is missing `{field}`"))
    })
}

impl Adapter for ComputerUseAdapter {
    type Raw = serde_json::Value;

    fn agent_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn convert(&self, raw: &serde_json::Value) -> Result<CanonicalAction> {
        let input: ToolInput = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::UnsupportedAction(format!("not a tool input: {e}")))?;
        let name = input.action.as_str();

        let action = match name {
            "screenshot" | "cursor_position" => CanonicalAction::FetchState,
            "mouse_move" => CanonicalAction::Move {
                point: *required(&point(input.coordinate), "coordinate", name)?,
            },
            "left_click" => click(&input, MouseButton::Left, 1)?,
            "right_click" => click(&input, MouseButton::Right, 1)?,
            "middle_click" => click(&input, MouseButton::Middle, 1)?,
            "double_click" => click(&input, MouseButton::Left, 2)?,
            "triple_click" => click(&input, MouseButton::Left, 3)?,
            "left_click_drag" => CanonicalAction::Drag {
                path: vec![
                    *required(&point(input.start_coordinate), "start_coordinate", name)?,
                    *required(&point(input.coordinate), "coordinate", name)?,
                ],
                button: MouseButton::Left,
                modifiers: BTreeSet::new(),
            },
            "scroll" => {
                let units = input.scroll_amount.unwrap_or(1);
                let amount = i32::try_from(units)
                    .ok()
                    .and_then(|units| units.checked_mul(SCROLL_STEP_PX))
                    .ok_or_else(|| {
                        CoreError::UnsupportedAction(format!("scroll_amount {units} is out of range"))
                    })?;
                let (dx, dy) = match required(&input.scroll_direction, "scroll_direction", name)?
                    .as_str()
                {
                    "up" => (0, -amount),
                    "down" => (0, amount),
                    "left" => (-amount, 0),
                    "right" => (amount, 0),
                    other => {
                        return Err(CoreError::UnsupportedAction(format!(
                            "unknown scroll direction '{other}'"
                        )))
                    }
                };
                CanonicalAction::Scroll {
                    point: point(input.coordinate),
                    dx,
                    dy,
                    modifiers: parse_modifiers(input.text.as_deref())?,
                }
            }
            "key" => {
                let keys = parse_chord(required(&input.text, "text", name)?)?;
                CanonicalAction::Press { keys }
            }
            "type" => CanonicalAction::Type {
                text: required(&input.text, "text", name)?.clone(),
                enter_after: false,
            },
            "wait" => {
                let seconds = input.duration.unwrap_or(1.0);
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(CoreError::UnsupportedAction(format!(
                        "invalid wait duration {seconds}"
                    )));
                }
                CanonicalAction::Wait {
                    duration_ms: (seconds * 1000.0).round() as u64,
                }
            }
            other => {
                return Err(CoreError::UnsupportedAction(format!(
                    "computer-use action '{other}' has no canonical equivalent"
                )))
            }
        };

        action.validate()?;
        Ok(action)
    }
}
