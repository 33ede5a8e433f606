//! Identity adapter for agents that already emit canonical actions.

use super::Adapter;
use crate::action::{self, CanonicalAction};
use crate::error::Result;
use crate::observation::Resolution;

/// Accepts canonical JSON actions and only validates them.
#[derive(Debug, Clone, Default)]
pub struct CanonicalAdapter {
    resolution: Option<Resolution>,
}

impl CanonicalAdapter {
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

impl Adapter for CanonicalAdapter {
    type Raw = serde_json::Value;

    fn agent_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn convert(&self, raw: &serde_json::Value) -> Result<CanonicalAction> {
        Ok(action::validate(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use serde_json::json;

    #[test]
    fn test_adapt_list_preserves_order() {
        let adapter = CanonicalAdapter::new();
        let actions = adapter
            .adapt_list(&[
                json!({"type": "type", "text": "a"}),
                json!({"type": "press", "keys": ["enter"]}),
            ])
            .unwrap();
        assert_eq!(actions[0].tag(), "type");
        assert_eq!(actions[1].tag(), "press");
    }

    #[test]
    fn test_adapt_list_fails_whole_batch() {
        let adapter = CanonicalAdapter::new();
        let err = adapter
            .adapt_list(&[
                json!({"type": "type", "text": "a"}),
                json!({"type": "teleport"}),
                json!({"type": "type", "text": "b"}),
            ])
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
