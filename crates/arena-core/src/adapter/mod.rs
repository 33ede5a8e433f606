//! Adapters between agent-native output and the canonical schema.
//!
//! An adapter is a stateless strategy shared by any number of environments.
//! It does two jobs:
//!
//! - **Conversion**: map one raw agent action to a [`CanonicalAction`].
//! - **Rescaling**: let the agent work at its own resolution. Observations
//!   are scaled down (target → agent) before the agent sees them, and the
//!   coordinates in its actions are scaled back up (agent → target) before
//!   dispatch, using the [`ResolutionPair`] recorded for that step.

mod canonical;
mod computer_use;
mod operator;

pub use canonical::CanonicalAdapter;
pub use computer_use::ComputerUseAdapter;
pub use operator::OperatorAdapter;

use crate::action::{CanonicalAction, Point};
use crate::error::{CoreError, Result};
use crate::observation::{Observation, Resolution};
use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;

/// The two resolutions involved in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPair {
    /// Resolution the agent reasons in
    pub agent: Resolution,
    /// Resolution of the target's screen
    pub target: Resolution,
}

impl ResolutionPair {
    /// Create a pair, rejecting zero-sized resolutions.
    pub fn new(agent: Resolution, target: Resolution) -> Result<Self> {
        check_resolution(agent)?;
        check_resolution(target)?;
        Ok(Self { agent, target })
    }

    /// Same resolution on both sides.
    pub fn identity(resolution: Resolution) -> Result<Self> {
        Self::new(resolution, resolution)
    }

    /// True when no scaling is needed.
    pub fn is_identity(&self) -> bool {
        self.agent == self.target
    }

    /// Map an agent-space point into target space.
    pub fn to_target(&self, point: Point) -> Point {
        scale_point(point, self.agent, self.target)
    }

    /// Map a target-space point into agent space.
    pub fn to_agent(&self, point: Point) -> Point {
        scale_point(point, self.target, self.agent)
    }
}

fn check_resolution(resolution: Resolution) -> Result<()> {
    if resolution.is_positive() {
        Ok(())
    } else {
        Err(CoreError::Configuration(format!(
            "resolution must be positive, got {resolution}"
        )))
    }
}

fn scale_axis(value: i32, from: u32, to: u32) -> i32 {
    (f64::from(value) * f64::from(to) / f64::from(from)).round() as i32
}

fn scale_point(point: Point, from: Resolution, to: Resolution) -> Point {
    Point {
        x: scale_axis(point.x, from.width, to.width),
        y: scale_axis(point.y, from.height, to.height),
    }
}

/// Strategy that turns agent output into canonical actions.
pub trait Adapter: Send + Sync + 'static {
    /// The agent's native action representation.
    type Raw: Send + Sync;

    /// Resolution the agent expects; `None` means it works in target space.
    fn agent_resolution(&self) -> Option<Resolution>;

    /// Convert one raw action.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnsupportedAction`] when the action has no canonical
    /// equivalent, [`CoreError::Validation`] when it maps to an invalid one.
    fn convert(&self, raw: &Self::Raw) -> Result<CanonicalAction>;

    /// Convert a batch, preserving order. The first failure aborts the whole batch.
    fn adapt_list(&self, raws: &[Self::Raw]) -> Result<Vec<CanonicalAction>> {
        raws.iter()
            .enumerate()
            .map(|(index, raw)| {
                self.convert(raw).map_err(|e| {
                    tracing::debug!(index, error = %e, "Action conversion failed, rejecting batch");
                    e
                })
            })
            .collect()
    }

    /// Rescale an observation from one resolution to another.
    fn rescale(&self, observation: Observation, from: Resolution, to: Resolution) -> Result<Observation> {
        rescale_observation(observation, from, to)
    }

    /// Map an agent-space action into target space.
    fn rescale_action(&self, action: CanonicalAction, pair: ResolutionPair) -> CanonicalAction {
        if pair.is_identity() {
            return action;
        }
        action.map_points(|p| pair.to_target(p))
    }
}

/// Resize an observation's screenshot and reported dimensions.
///
/// Screenshots that cannot be decoded keep their bytes; only the reported
/// dimensions change.
///
/// # Errors
///
/// Returns [`CoreError::Configuration`] if either resolution is zero-sized.
pub fn rescale_observation(
    mut observation: Observation,
    from: Resolution,
    to: Resolution,
) -> Result<Observation> {
    check_resolution(from)?;
    check_resolution(to)?;
    if from == to {
        return Ok(observation.with_resolution(to));
    }

    if let Some(bytes) = observation.screenshot.take() {
        observation.screenshot = Some(match resample_png(&bytes, to) {
            Ok(resized) => resized,
            Err(e) => {
                tracing::debug!(error = %e, "Screenshot not decodable, keeping original bytes");
                bytes
            }
        });
    }
    Ok(observation.with_resolution(to))
}

fn resample_png(bytes: &[u8], to: Resolution) -> image::ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let resized = img.resize_exact(to.width, to.height, FilterType::Triangle);
    let mut out = Vec::new();
    resized.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
