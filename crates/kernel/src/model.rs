//! Control-point sets fed to the multi-parameter kernel.
//!
//! A pair of complex control points `(x, y)` can be handed to the kernel
//! as-is or through one of the derived forms below. Complex values are plain
//! `[re, im]` pairs.

use serde::{Deserialize, Serialize};

pub type Complex = [f32; 2];

pub fn add(a: Complex, b: Complex) -> Complex {
    [a[0] + b[0], a[1] + b[1]]
}

pub fn mul(a: Complex, b: Complex) -> Complex {
    [a[0] * b[0] - a[1] * b[1], a[0] * b[1] + a[1] * b[0]]
}

pub fn scale(a: Complex, factor: f32) -> Complex {
    [a[0] * factor, a[1] * factor]
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Derivation {
    /// `[x, y]`
    #[default]
    Identity,
    /// `[2xy + y², x² + 2xy]`
    Quadratic,
    /// `[2(y + x), 2x]`
    Linear,
}

impl Derivation {
    pub const ALL: [Derivation; 3] = [Self::Identity, Self::Quadratic, Self::Linear];

    pub fn apply(self, [x, y]: [Complex; 2]) -> [Complex; 2] {
        match self {
            Self::Identity => [x, y],
            Self::Quadratic => {
                let cross = scale(mul(x, y), 2.0);
                [add(cross, mul(y, y)), add(mul(x, x), cross)]
            }
            Self::Linear => [scale(add(y, x), 2.0), scale(x, 2.0)],
        }
    }
}

/// Two control points plus the derivation applied before upload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlPointModel {
    pub points: [Complex; 2],
    pub derivation: Derivation,
}

impl ControlPointModel {
    pub fn new(points: [Complex; 2]) -> Self {
        Self {
            points,
            derivation: Derivation::Identity,
        }
    }

    pub fn with_derivation(mut self, derivation: Derivation) -> Self {
        self.derivation = derivation;
        self
    }

    pub fn derived(&self) -> [Complex; 2] {
        self.derivation.apply(self.points)
    }
}

impl Default for ControlPointModel {
    fn default() -> Self {
        Self::new([[0.0, 0.0], [-0.5, 0.25]])
    }
}
