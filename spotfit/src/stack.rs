//! Interfaces to the host image stack and its display.

use common::Buffer2;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::position_sync::PositionSync;

/// Extent of a channel × slice × frame image stack at one stage position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDims {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub slices: usize,
    pub frames: usize,
}

impl StackDims {
    pub fn plane_count(&self) -> usize {
        self.channels * self.slices * self.frames
    }
}

/// Rectangular region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Intersect with a `width` × `height` image. `None` if nothing is left.
    pub fn clamp_to(&self, width: usize, height: usize) -> Option<Region> {
        let x1 = (self.x + self.width).min(width);
        let y1 = (self.y + self.height).min(height);
        if self.x >= x1 || self.y >= y1 {
            return None;
        }
        Some(Region::new(self.x, self.y, x1 - self.x, y1 - self.y))
    }
}

/// The active image stack.
///
/// Plane indices are 1-based. Planes are read from whichever stage position
/// the host currently displays.
pub trait StackSource: Send + Sync {
    fn title(&self) -> String;

    fn dims(&self) -> StackDims;

    /// Copy one 2-D plane. Fails with [`crate::Error::Allocation`] when the
    /// pixel buffer cannot be allocated.
    fn plane(&self, channel: usize, slice: usize, frame: usize) -> Result<Buffer2<f32>>;
}

/// Host viewer that owns the displayed stage position.
///
/// Positions are 0-based. `request_position` only asks for a change; the
/// host later confirms it by calling [`PositionSync::pixels_updated`] on the
/// subscribed synchronizer, from any thread.
pub trait DisplayHost: Send + Sync {
    fn position_count(&self) -> usize;

    fn current_position(&self) -> usize;

    fn request_position(&self, position: usize);

    fn subscribe(&self, sync: PositionSync);

    fn unsubscribe(&self);

    /// The user's current selection.
    fn region(&self) -> Option<Region>;

    fn set_region(&self, region: Option<Region>);
}
