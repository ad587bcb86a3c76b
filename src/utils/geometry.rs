use std::{fmt, str::FromStr};

use wayland_client::{protocol::wl_output::Transform as WlTransform, WEnum};

/// Possible transformations to two-dimensional planes
///
/// Outputs advertise the transformation the compositor applies when presenting to them,
/// captured frames have to be transformed back to be presented upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

impl Transform {
    /// Inverts any 90-degree transformation into 270-degree transformations and vise versa.
    ///
    /// Flipping is preserved and 180/Normal transformation are uneffected.
    #[inline]
    pub fn invert(&self) -> Transform {
        match self {
            Transform::Normal => Transform::Normal,
            Transform::Flipped => Transform::Flipped,
            Transform::_90 => Transform::_270,
            Transform::_180 => Transform::_180,
            Transform::_270 => Transform::_90,
            Transform::Flipped90 => Transform::Flipped270,
            Transform::Flipped180 => Transform::Flipped180,
            Transform::Flipped270 => Transform::Flipped90,
        }
    }

    /// Transformed size after applying this transformation.
    #[inline]
    pub fn transform_size(&self, (w, h): (u32, u32)) -> (u32, u32) {
        if self.degrees() % 180 == 90 {
            (h, w)
        } else {
            (w, h)
        }
    }

    /// Returns true if the transformation would flip contents
    pub fn flipped(&self) -> bool {
        !matches!(
            self,
            Transform::Normal | Transform::_90 | Transform::_180 | Transform::_270
        )
    }

    /// Returns the angle (in degrees) of the transformation
    #[inline]
    pub fn degrees(&self) -> u32 {
        match self {
            Transform::Normal | Transform::Flipped => 0,
            Transform::_90 | Transform::Flipped90 => 90,
            Transform::_180 | Transform::Flipped180 => 180,
            Transform::_270 | Transform::Flipped270 => 270,
        }
    }
}

impl From<WlTransform> for Transform {
    #[inline]
    fn from(transform: WlTransform) -> Self {
        match transform {
            WlTransform::_90 => Transform::_90,
            WlTransform::_180 => Transform::_180,
            WlTransform::_270 => Transform::_270,
            WlTransform::Flipped => Transform::Flipped,
            WlTransform::Flipped90 => Transform::Flipped90,
            WlTransform::Flipped180 => Transform::Flipped180,
            WlTransform::Flipped270 => Transform::Flipped270,
            _ => Transform::Normal,
        }
    }
}

impl From<WEnum<WlTransform>> for Transform {
    #[inline]
    fn from(transform: WEnum<WlTransform>) -> Self {
        match transform {
            WEnum::Value(transform) => transform.into(),
            WEnum::Unknown(_) => Transform::Normal,
        }
    }
}

/// A rectangular sub-area of an output, in logical coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Horizontal offset
    pub x: i32,
    /// Vertical offset
    pub y: i32,
    /// Width of the area
    pub width: i32,
    /// Height of the area
    pub height: i32,
}

impl Region {
    /// Whether the region covers no area at all
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// Error returned when parsing a [`Region`] fails
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid region `{0}`, expected `x,y wxh`")]
pub struct ParseRegionError(String);

impl FromStr for Region {
    type Err = ParseRegionError;

    /// Parses the `x,y wxh` format produced by `slurp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRegionError(s.to_owned());
        let (loc, size) = s.trim().split_once(' ').ok_or_else(err)?;
        let (x, y) = loc.split_once(',').ok_or_else(err)?;
        let (w, h) = size.trim().split_once('x').ok_or_else(err)?;

        let region = Region {
            x: x.trim().parse().map_err(|_| err())?,
            y: y.trim().parse().map_err(|_| err())?,
            width: w.trim().parse().map_err(|_| err())?,
            height: h.trim().parse().map_err(|_| err())?,
        };
        if region.is_empty() {
            return Err(err());
        }
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::{Region, Transform};

    #[test]
    fn transform_size_swaps_on_quarter_turns() {
        assert_eq!(Transform::Normal.transform_size((1920, 1080)), (1920, 1080));
        assert_eq!(Transform::_90.transform_size((1920, 1080)), (1080, 1920));
        assert_eq!(Transform::Flipped270.transform_size((1920, 1080)), (1080, 1920));
        assert_eq!(Transform::Flipped180.transform_size((1920, 1080)), (1920, 1080));
    }

    #[test]
    fn invert_is_an_involution() {
        for transform in [
            Transform::Normal,
            Transform::_90,
            Transform::_180,
            Transform::_270,
            Transform::Flipped,
            Transform::Flipped90,
            Transform::Flipped180,
            Transform::Flipped270,
        ] {
            assert_eq!(transform.invert().invert(), transform);
            assert_eq!(transform.invert().flipped(), transform.flipped());
        }
    }

    #[test]
    fn region_parses_slurp_format() {
        let region: Region = "10,20 300x200".parse().unwrap();
        assert_eq!(
            region,
            Region {
                x: 10,
                y: 20,
                width: 300,
                height: 200
            }
        );
        assert_eq!(region.to_string(), "10,20 300x200");
    }

    #[test]
    fn region_rejects_garbage() {
        assert!("10,20".parse::<Region>().is_err());
        assert!("a,b cxd".parse::<Region>().is_err());
        assert!("0,0 0x10".parse::<Region>().is_err());
    }
}
