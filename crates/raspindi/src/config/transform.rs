//! Image orientation from the `mirror` and `rotation` settings

use std::fmt;

use crate::error::{Error, Result};

/// A combination of flips followed by an optional transpose.
///
/// Flips are always applied before the transpose, which makes composition
/// a matter of reordering the second transform's flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transform {
    pub hflip: bool,
    pub vflip: bool,
    pub transpose: bool,
}

impl Transform {
    pub const IDENTITY: Transform = Transform::new(false, false, false);
    pub const HFLIP: Transform = Transform::new(true, false, false);
    pub const VFLIP: Transform = Transform::new(false, true, false);
    pub const ROT180: Transform = Transform::new(true, true, false);
    pub const ROT90: Transform = Transform::new(true, false, true);
    pub const ROT270: Transform = Transform::new(false, true, true);

    const fn new(hflip: bool, vflip: bool, transpose: bool) -> Self {
        Self {
            hflip,
            vflip,
            transpose,
        }
    }

    /// Transform for a clockwise rotation in degrees.
    ///
    /// Only multiples of 90 are legal; negative angles and angles of a full
    /// turn or more wrap around.
    pub fn from_rotation(degrees: i64) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::IDENTITY),
            90 => Ok(Self::ROT90),
            180 => Ok(Self::ROT180),
            270 => Ok(Self::ROT270),
            _ => Err(Error::IllegalRotation(degrees)),
        }
    }

    /// Transform for a `mirror` setting. Unknown values mean no mirroring.
    pub fn from_mirror(mode: &str) -> Self {
        match mode {
            "horizontal" => Self::HFLIP,
            "vertical" => Self::VFLIP,
            "both" => Self::ROT180,
            _ => Self::IDENTITY,
        }
    }

    /// Apply `self` first, then `next`.
    pub fn then(self, next: Transform) -> Transform {
        let (h, v) = if self.transpose {
            (next.vflip, next.hflip)
        } else {
            (next.hflip, next.vflip)
        };
        Transform {
            hflip: self.hflip ^ h,
            vflip: self.vflip ^ v,
            transpose: self.transpose ^ next.transpose,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::IDENTITY => "identity",
            Self::HFLIP => "hflip",
            Self::VFLIP => "vflip",
            Self::ROT180 => "rot180",
            Self::ROT90 => "rot90",
            Self::ROT270 => "rot270",
            Transform {
                hflip: false,
                vflip: false,
                ..
            } => "transpose",
            _ => "rot180-transpose",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotations() {
        assert_eq!(Transform::from_rotation(0).unwrap(), Transform::IDENTITY);
        assert_eq!(Transform::from_rotation(180).unwrap(), Transform::ROT180);
        assert_eq!(Transform::from_rotation(-90).unwrap(), Transform::ROT270);
        assert_eq!(Transform::from_rotation(450).unwrap(), Transform::ROT90);
    }

    #[test]
    fn illegal_rotation() {
        assert!(matches!(
            Transform::from_rotation(45),
            Err(Error::IllegalRotation(45))
        ));
    }

    #[test]
    fn mirror_modes() {
        assert_eq!(Transform::from_mirror("none"), Transform::IDENTITY);
        assert_eq!(Transform::from_mirror("horizontal"), Transform::HFLIP);
        assert_eq!(Transform::from_mirror("vertical"), Transform::VFLIP);
        assert_eq!(Transform::from_mirror("both"), Transform::ROT180);
        assert_eq!(Transform::from_mirror("sideways"), Transform::IDENTITY);
    }

    #[test]
    fn flips_compose_by_xor() {
        assert_eq!(Transform::HFLIP.then(Transform::ROT180), Transform::VFLIP);
        assert!(Transform::ROT180.then(Transform::ROT180).is_identity());
    }

    #[test]
    fn quarter_turns_compose() {
        assert_eq!(Transform::ROT90.then(Transform::ROT90), Transform::ROT180);
        assert!(Transform::ROT90.then(Transform::ROT270).is_identity());
    }

    #[test]
    fn display_names() {
        assert_eq!(Transform::ROT180.to_string(), "rot180");
        assert_eq!(Transform::new(false, false, true).to_string(), "transpose");
    }
}
