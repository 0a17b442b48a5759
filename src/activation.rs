use crate::errors::{PintError, PintResult};

/// Half-width of the quadratic blending region of the smooth ReLU.
const SMOOTH_ETA: f64 = 0.1;

/// Pointwise nonlinearity applied by the residual layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    ReLu,
    SmoothReLu,
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::ReLu => x.max(0.0),
            Activation::SmoothReLu => {
                if x < -SMOOTH_ETA {
                    0.0
                } else if x > SMOOTH_ETA {
                    x
                } else {
                    x * x / (4.0 * SMOOTH_ETA) + x / 2.0 + SMOOTH_ETA / 4.0
                }
            }
        }
    }

    pub fn diff(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Activation::ReLu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::SmoothReLu => {
                if x < -SMOOTH_ETA {
                    0.0
                } else if x > SMOOTH_ETA {
                    1.0
                } else {
                    x / (2.0 * SMOOTH_ETA) + 0.5
                }
            }
        }
    }

    /// Numeric code used in the migration wire header.
    pub fn code(self) -> f64 {
        match self {
            Activation::Tanh => 0.0,
            Activation::ReLu => 1.0,
            Activation::SmoothReLu => 2.0,
        }
    }

    pub fn from_code(code: f64) -> PintResult<Self> {
        match code as i64 {
            0 => Ok(Activation::Tanh),
            1 => Ok(Activation::ReLu),
            2 => Ok(Activation::SmoothReLu),
            other => Err(PintError::Wire(format!("unknown activation code {other}"))),
        }
    }

    pub fn parse(name: &str) -> PintResult<Self> {
        match name {
            "tanh" => Ok(Activation::Tanh),
            "ReLu" => Ok(Activation::ReLu),
            "SmoothReLu" => Ok(Activation::SmoothReLu),
            other => Err(PintError::Config(format!("invalid activation function: {other}"))),
        }
    }

    /// Configuration-file spelling of this activation.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::ReLu => "ReLu",
            Activation::SmoothReLu => "SmoothReLu",
        }
    }
}
