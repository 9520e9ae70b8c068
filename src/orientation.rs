//! Display rotation handling for input coordinate transforms.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Display rotation relative to the panel's natural orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Rotation {
    /// Natural orientation, no rotation.
    #[default]
    #[serde(rename = "0")]
    Rot0,
    /// Rotated 90° counter-clockwise.
    #[serde(rename = "90")]
    Rot90,
    #[serde(rename = "180")]
    Rot180,
    #[serde(rename = "270")]
    Rot270,
}

impl Rotation {
    /// Quarter-turn count, usable as a rotation-table index.
    pub fn index(self) -> usize {
        match self {
            Rotation::Rot0 => 0,
            Rotation::Rot90 => 1,
            Rotation::Rot180 => 2,
            Rotation::Rot270 => 3,
        }
    }

    /// Transform a point from natural display space to oriented display
    /// space. `width` and `height` are the natural (unrotated) display size.
    pub fn transform_point(self, x: f32, y: f32, width: f32, height: f32) -> (f32, f32) {
        match self {
            Rotation::Rot0 => (x, y),
            Rotation::Rot90 => (y, width - x),
            Rotation::Rot180 => (width - x, height - y),
            Rotation::Rot270 => (height - y, x),
        }
    }

    /// Transform a velocity vector; same rotation as [`transform_point`]
    /// without the display-extent offset.
    ///
    /// [`transform_point`]: Rotation::transform_point
    pub fn transform_delta(self, dx: f32, dy: f32) -> (f32, f32) {
        match self {
            Rotation::Rot0 => (dx, dy),
            Rotation::Rot90 => (dy, -dx),
            Rotation::Rot180 => (-dx, -dy),
            Rotation::Rot270 => (-dy, dx),
        }
    }

    /// Display size as seen in the oriented frame.
    pub fn oriented_size(self, width: i32, height: i32) -> (i32, i32) {
        match self {
            Rotation::Rot0 | Rotation::Rot180 => (width, height),
            Rotation::Rot90 | Rotation::Rot270 => (height, width),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rotation::Rot0 => write!(f, "0"),
            Rotation::Rot90 => write!(f, "90"),
            Rotation::Rot180 => write!(f, "180"),
            Rotation::Rot270 => write!(f, "270"),
        }
    }
}

impl FromStr for Rotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Rotation::Rot0),
            "90" => Ok(Rotation::Rot90),
            "180" => Ok(Rotation::Rot180),
            "270" => Ok(Rotation::Rot270),
            _ => Err(format!(
                "Invalid rotation '{}'. Valid values: 0, 90, 180, 270",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_transforms() {
        let (w, h) = (1024.0, 768.0);
        assert_eq!(Rotation::Rot0.transform_point(100.0, 200.0, w, h), (100.0, 200.0));
        assert_eq!(Rotation::Rot90.transform_point(100.0, 200.0, w, h), (200.0, 924.0));
        assert_eq!(Rotation::Rot180.transform_point(100.0, 200.0, w, h), (924.0, 568.0));
        assert_eq!(Rotation::Rot270.transform_point(100.0, 200.0, w, h), (568.0, 100.0));
    }

    #[test]
    fn delta_transforms() {
        assert_eq!(Rotation::Rot90.transform_delta(1.0, 0.0), (0.0, -1.0));
        assert_eq!(Rotation::Rot180.transform_delta(1.0, 2.0), (-1.0, -2.0));
        assert_eq!(Rotation::Rot270.transform_delta(1.0, 0.0), (0.0, 1.0));
    }

    #[test]
    fn oriented_size_swaps_on_quarter_turns() {
        assert_eq!(Rotation::Rot0.oriented_size(1024, 768), (1024, 768));
        assert_eq!(Rotation::Rot90.oriented_size(1024, 768), (768, 1024));
        assert_eq!(Rotation::Rot270.oriented_size(1024, 768), (768, 1024));
    }

    #[test]
    fn from_str() {
        assert_eq!("90".parse::<Rotation>().unwrap(), Rotation::Rot90);
        assert!("45".parse::<Rotation>().is_err());
    }
}
