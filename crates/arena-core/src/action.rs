//! Canonical action schema.
//!
//! Every action an agent produces is converted into a [`CanonicalAction`]
//! before it reaches a target. The wire form is an object tagged by `type`:
//!
//! ```json
//! {"type": "click", "point": {"x": 10, "y": 20}, "button": "left"}
//! {"type": "press", "keys": ["ctrl", "c"]}
//! {"type": "type", "text": "hello", "enter_after": true}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Every tag the schema accepts.
pub const ACTION_TAGS: &[&str] = &[
    "move",
    "click",
    "scroll",
    "drag",
    "press",
    "key_down",
    "key_up",
    "type",
    "wait",
    "fetch_state",
    "response",
    "custom",
];

/// Highest click count accepted (triple click).
const MAX_CLICK_COUNT: u8 = 3;

/// Reasons a payload is not a valid canonical action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload is not a JSON object
    #[error("action must be a JSON object")]
    NotAnObject,

    /// No `type` field
    #[error("action has no `type` tag")]
    MissingTag,

    /// `type` is not one of [`ACTION_TAGS`]
    #[error("unknown action type '{0}'")]
    UnknownTag(String),

    /// Fields do not match the variant's shape
    #[error("malformed '{tag}' action: {message}")]
    Malformed {
        /// Variant tag
        tag: String,
        /// Deserializer message
        message: String,
    },

    /// A coordinate is negative
    #[error("{field} has negative coordinate ({x}, {y})")]
    NegativeCoordinate {
        /// Which field carried the point
        field: &'static str,
        /// X coordinate
        x: i32,
        /// Y coordinate
        y: i32,
    },

    /// Drag path shorter than two points
    #[error("drag path needs at least 2 points, got {0}")]
    PathTooShort(usize),

    /// Key action with no keys
    #[error("'{0}' action needs at least one key")]
    EmptyKeys(&'static str),

    /// Key name outside the closed key set
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    /// Click count outside 1..=3
    #[error("click count must be between 1 and {MAX_CLICK_COUNT}, got {0}")]
    InvalidClickCount(u8),

    /// Custom action without a name
    #[error("custom action needs a non-empty name")]
    EmptyName,
}

/// A pixel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal pixel offset from the left edge
    pub x: i32,
    /// Vertical pixel offset from the top edge
    pub y: i32,
}

impl Point {
    /// Create a point.
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn check(self, field: &'static str) -> Result<(), ValidationError> {
        if self.x < 0 || self.y < 0 {
            return Err(ValidationError::NegativeCoordinate {
                field,
                x: self.x,
                y: self.y,
            });
        }
        Ok(())
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// Mouse button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    /// Primary button
    #[default]
    Left,
    /// Secondary button
    Right,
    /// Wheel button
    Middle,
    /// Browser back
    Back,
    /// Browser forward
    Forward,
}

/// Modifier held during a pointer action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// Shift
    Shift,
    /// Control
    #[serde(alias = "control")]
    Ctrl,
    /// Alt / Option
    #[serde(alias = "option")]
    Alt,
    /// Meta / Command / Super
    #[serde(alias = "cmd", alias = "command", alias = "super", alias = "win")]
    Meta,
}

/// A key from the closed key set.
///
/// Named keys are matched case-insensitively with common aliases
/// (`return`, `esc`, `arrowup`, `pgdn`, `cmd`, ...). Any single printable
/// ASCII character is a [`Key::Char`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Insert,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    CapsLock,
    Shift,
    Ctrl,
    Alt,
    Meta,
    /// Function key `F1` to `F12`
    F(u8),
    /// A printable ASCII character
    Char(char),
}

impl Key {
    /// Parse a key name.
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        let mut chars = name.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return match c {
                ' ' => Ok(Self::Space),
                c if c.is_ascii_graphic() => Ok(Self::Char(c)),
                _ => Err(ValidationError::UnknownKey(name.to_string())),
            };
        }

        let lower = name.to_ascii_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            "escape" | "esc" => Self::Escape,
            "backspace" => Self::Backspace,
            "delete" | "del" => Self::Delete,
            "insert" | "ins" => Self::Insert,
            "space" | "spacebar" => Self::Space,
            "up" | "arrowup" => Self::Up,
            "down" | "arrowdown" => Self::Down,
            "left" | "arrowleft" => Self::Left,
            "right" | "arrowright" => Self::Right,
            "home" => Self::Home,
            "end" => Self::End,
            "pageup" | "page_up" | "pgup" | "prior" => Self::PageUp,
            "pagedown" | "page_down" | "pgdn" | "next" => Self::PageDown,
            "capslock" | "caps_lock" => Self::CapsLock,
            "shift" => Self::Shift,
            "ctrl" | "control" => Self::Ctrl,
            "alt" | "option" => Self::Alt,
            "meta" | "cmd" | "command" | "super" | "win" => Self::Meta,
            other => match other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=12) => Self::F(n),
                _ => return Err(ValidationError::UnknownKey(name.to_string())),
            },
        };
        Ok(key)
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> String {
        match self {
            Self::Enter => "enter".into(),
            Self::Tab => "tab".into(),
            Self::Escape => "escape".into(),
            Self::Backspace => "backspace".into(),
            Self::Delete => "delete".into(),
            Self::Insert => "insert".into(),
            Self::Space => "space".into(),
            Self::Up => "up".into(),
            Self::Down => "down".into(),
            Self::Left => "left".into(),
            Self::Right => "right".into(),
            Self::Home => "home".into(),
            Self::End => "end".into(),
            Self::PageUp => "pageup".into(),
            Self::PageDown => "pagedown".into(),
            Self::CapsLock => "capslock".into(),
            Self::Shift => "shift".into(),
            Self::Ctrl => "ctrl".into(),
            Self::Alt => "alt".into(),
            Self::Meta => "meta".into(),
            Self::F(n) => format!("f{n}"),
            Self::Char(c) => c.to_string(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl TryFrom<String> for Key {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.name()
    }
}

fn default_click_count() -> u8 {
    1
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// The canonical action representation dispatched to targets.
///
/// Coordinates are in the target's native pixel space once an adapter has
/// processed the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalAction {
    /// Move the pointer.
    Move {
        /// Destination
        point: Point,
    },
    /// Click, optionally after moving to `point`.
    Click {
        /// Where to click; `None` clicks at the current pointer position
        #[serde(default, skip_serializing_if = "Option::is_none")]
        point: Option<Point>,
        /// Button to click
        #[serde(default)]
        button: MouseButton,
        /// 1 = single, 2 = double, 3 = triple
        #[serde(default = "default_click_count")]
        count: u8,
        /// Modifiers held during the click
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        modifiers: BTreeSet<Modifier>,
    },
    /// Scroll by a pixel delta.
    Scroll {
        /// Where to scroll; `None` scrolls at the current pointer position
        #[serde(default, skip_serializing_if = "Option::is_none")]
        point: Option<Point>,
        /// Horizontal delta (positive = right)
        #[serde(default)]
        dx: i32,
        /// Vertical delta (positive = down)
        #[serde(default)]
        dy: i32,
        /// Modifiers held during the scroll
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        modifiers: BTreeSet<Modifier>,
    },
    /// Press at the first point, move through the rest, release at the last.
    Drag {
        /// At least two points
        path: Vec<Point>,
        /// Button held during the drag
        #[serde(default)]
        button: MouseButton,
        /// Modifiers held during the drag
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        modifiers: BTreeSet<Modifier>,
    },
    /// Press and release a key chord.
    Press {
        /// Keys, pressed in order and released in reverse
        keys: Vec<Key>,
    },
    /// Hold keys down.
    KeyDown {
        /// Keys to hold
        keys: Vec<Key>,
    },
    /// Release held keys.
    KeyUp {
        /// Keys to release
        keys: Vec<Key>,
    },
    /// Type text. An empty `text` is valid and types nothing.
    Type {
        /// Text to type
        text: String,
        /// Press enter after typing
        #[serde(default, skip_serializing_if = "is_default")]
        enter_after: bool,
    },
    /// Pause before the next action.
    Wait {
        /// Duration in milliseconds
        duration_ms: u64,
    },
    /// Ask the target for a fresh observation without acting.
    FetchState,
    /// Submit the agent's final answer; ends the episode.
    Response {
        /// The answer
        text: String,
    },
    /// Controller-specific action passed through untouched.
    Custom {
        /// Controller action name
        name: String,
        /// Opaque arguments
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<serde_json::Value>,
    },
}

impl CanonicalAction {
    /// Shorthand for a plain left click at `(x, y)`.
    pub fn click(x: i32, y: i32) -> Self {
        Self::Click {
            point: Some(Point::new(x, y)),
            button: MouseButton::Left,
            count: 1,
            modifiers: BTreeSet::new(),
        }
    }

    /// Shorthand for typing `text`.
    pub fn type_text(text: impl Into<String>) -> Self {
        Self::Type {
            text: text.into(),
            enter_after: false,
        }
    }

    /// Shorthand for pressing a single key or chord.
    pub fn press(keys: impl IntoIterator<Item = Key>) -> Self {
        Self::Press {
            keys: keys.into_iter().collect(),
        }
    }

    /// The wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::Drag { .. } => "drag",
            Self::Press { .. } => "press",
            Self::KeyDown { .. } => "key_down",
            Self::KeyUp { .. } => "key_up",
            Self::Type { .. } => "type",
            Self::Wait { .. } => "wait",
            Self::FetchState => "fetch_state",
            Self::Response { .. } => "response",
            Self::Custom { .. } => "custom",
        }
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Move { point } => point.check("point"),
            Self::Click { point, count, .. } => {
                if !(1..=MAX_CLICK_COUNT).contains(count) {
                    return Err(ValidationError::InvalidClickCount(*count));
                }
                point.map_or(Ok(()), |p| p.check("point"))
            }
            Self::Scroll { point, .. } => point.map_or(Ok(()), |p| p.check("point")),
            Self::Drag { path, .. } => {
                if path.len() < 2 {
                    return Err(ValidationError::PathTooShort(path.len()));
                }
                path.iter().try_for_each(|p| p.check("path"))
            }
            Self::Press { keys } if keys.is_empty() => Err(ValidationError::EmptyKeys("press")),
            Self::KeyDown { keys } if keys.is_empty() => {
                Err(ValidationError::EmptyKeys("key_down"))
            }
            Self::KeyUp { keys } if keys.is_empty() => Err(ValidationError::EmptyKeys("key_up")),
            Self::Custom { name, .. } if name.trim().is_empty() => Err(ValidationError::EmptyName),
            _ => Ok(()),
        }
    }

    /// True when dispatching the action would change nothing in the target.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Type { text, enter_after: false } if text.is_empty())
    }

    /// Every point carried by the action.
    pub fn points(&self) -> Vec<Point> {
        match self {
            Self::Move { point } => vec![*point],
            Self::Click { point, .. } | Self::Scroll { point, .. } => point.iter().copied().collect(),
            Self::Drag { path, .. } => path.clone(),
            _ => Vec::new(),
        }
    }

    /// Apply `f` to every point, leaving other fields untouched.
    pub fn map_points(self, f: impl Fn(Point) -> Point) -> Self {
        match self {
            Self::Move { point } => Self::Move { point: f(point) },
            Self::Click {
                point,
                button,
                count,
                modifiers,
            } => Self::Click {
                point: point.map(&f),
                button,
                count,
                modifiers,
            },
            Self::Scroll {
                point,
                dx,
                dy,
                modifiers,
            } => Self::Scroll {
                point: point.map(&f),
                dx,
                dy,
                modifiers,
            },
            Self::Drag {
                path,
                button,
                modifiers,
            } => Self::Drag {
                path: path.into_iter().map(&f).collect(),
                button,
                modifiers,
            },
            other => other,
        }
    }
}

/// Validate a raw JSON payload into a canonical action.
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the first violated rule.
pub fn validate(raw: &serde_json::Value) -> Result<CanonicalAction, ValidationError> {
    let object = raw.as_object().ok_or(ValidationError::NotAnObject)?;
    let tag = object
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ValidationError::MissingTag)?;
    if !ACTION_TAGS.contains(&tag) {
        return Err(ValidationError::UnknownTag(tag.to_string()));
    }

    let action: CanonicalAction =
        serde_json::from_value(raw.clone()).map_err(|e| ValidationError::Malformed {
            tag: tag.to_string(),
            message: e.to_string(),
        })?;
    action.validate()?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_click() {
        let action = validate(&json!({"type": "click", "point": {"x": 10, "y": 20}})).unwrap();
        assert_eq!(action, CanonicalAction::click(10, 20));
        assert_eq!(action.tag(), "click");
    }

    #[test]
    fn test_unknown_and_missing_tag() {
        assert_eq!(
            validate(&json!({"type": "zoom"})),
            Err(ValidationError::UnknownTag("zoom".into()))
        );
        assert_eq!(validate(&json!({"x": 1})), Err(ValidationError::MissingTag));
        assert_eq!(validate(&json!("click")), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn test_negative_coordinates_rejected() {
        let err = validate(&json!({"type": "move", "point": {"x": -1, "y": 5}})).unwrap_err();
        assert!(matches!(err, ValidationError::NegativeCoordinate { x: -1, .. }));
    }

    #[test]
    fn test_drag_path_length() {
        let err = validate(&json!({"type": "drag", "path": [{"x": 0, "y": 0}]})).unwrap_err();
        assert_eq!(err, ValidationError::PathTooShort(1));

        let ok = validate(&json!({
            "type": "drag",
            "path": [{"x": 0, "y": 0}, {"x": 5, "y": 5}],
            "modifiers": ["shift"]
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_type_text_presence() {
        let empty = validate(&json!({"type": "type", "text": ""})).unwrap();
        assert!(empty.is_noop());

        let err = validate(&json!({"type": "type"})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));

        let enter = validate(&json!({"type": "type", "text": "", "enter_after": true})).unwrap();
        assert!(!enter.is_noop());
    }

    #[test]
    fn test_key_names() {
        assert_eq!(Key::parse("Return").unwrap(), Key::Enter);
        assert_eq!(Key::parse("ArrowUp").unwrap(), Key::Up);
        assert_eq!(Key::parse("cmd").unwrap(), Key::Meta);
        assert_eq!(Key::parse("F12").unwrap(), Key::F(12));
        assert_eq!(Key::parse("a").unwrap(), Key::Char('a'));
        assert_eq!(Key::parse(" ").unwrap(), Key::Space);
        assert!(Key::parse("F13").is_err());
        assert!(Key::parse("hyper").is_err());
        assert!(Key::parse("").is_err());

        let err = validate(&json!({"type": "press", "keys": ["ctrl", "bogus"]})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { ref message, .. } if message.contains("bogus")));
    }

    #[test]
    fn test_key_wire_form_is_canonical_name() {
        let action = validate(&json!({"type": "press", "keys": ["Control", "C"]})).unwrap();
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"type": "press", "keys": ["ctrl", "C"]})
        );
    }

    #[test]
    fn test_empty_keys_rejected() {
        assert_eq!(
            validate(&json!({"type": "key_down", "keys": []})),
            Err(ValidationError::EmptyKeys("key_down"))
        );
    }

    #[test]
    fn test_wait_rejects_negative_duration() {
        let err = validate(&json!({"type": "wait", "duration_ms": -5})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));
        assert!(validate(&json!({"type": "wait", "duration_ms": 250})).is_ok());
    }

    #[test]
    fn test_click_count_bounds() {
        let err = validate(&json!({"type": "click", "count": 4})).unwrap_err();
        assert_eq!(err, ValidationError::InvalidClickCount(4));
    }

    #[test]
    fn test_modifier_aliases() {
        let action = validate(&json!({
            "type": "click",
            "point": {"x": 1, "y": 1},
            "modifiers": ["control", "cmd"]
        }))
        .unwrap();
        let CanonicalAction::Click { modifiers, .. } = action else {
            panic!("expected click");
        };
        assert!(modifiers.contains(&Modifier::Ctrl));
        assert!(modifiers.contains(&Modifier::Meta));
    }

    #[test]
    fn test_map_points_touches_only_coordinates() {
        let action = CanonicalAction::Drag {
            path: vec![Point::new(1, 2), Point::new(3, 4)],
            button: MouseButton::Right,
            modifiers: BTreeSet::new(),
        };
        let doubled = action.map_points(|p| Point::new(p.x * 2, p.y * 2));
        assert_eq!(doubled.points(), vec![Point::new(2, 4), Point::new(6, 8)]);
        assert!(matches!(doubled, CanonicalAction::Drag { button: MouseButton::Right, .. }));

        let text = CanonicalAction::type_text("hi").map_points(|_| Point::new(0, 0));
        assert_eq!(text, CanonicalAction::type_text("hi"));
    }

    #[test]
    fn test_custom_requires_name() {
        assert_eq!(
            validate(&json!({"type": "custom", "name": " "})),
            Err(ValidationError::EmptyName)
        );
        let ok = validate(&json!({"type": "custom", "name": "zoom", "args": [2]})).unwrap();
        assert_eq!(ok.tag(), "custom");
    }
}
