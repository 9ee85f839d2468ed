//! Activation functions for connected layers.
//!
//! Gradients are expressed in terms of the already-activated output, so a
//! layer can apply them to its delta without keeping the pre-activation values.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Logistic,
    /// Logistic rescaled to (-1, 1).
    Loggy,
    Relu,
    /// Leaky ReLU with slope 0.1.
    Leaky,
    Tanh,
}

impl Activation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(Self::Linear),
            "logistic" => Some(Self::Logistic),
            "loggy" => Some(Self::Loggy),
            "relu" => Some(Self::Relu),
            "leaky" => Some(Self::Leaky),
            "tanh" => Some(Self::Tanh),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Logistic => "logistic",
            Self::Loggy => "loggy",
            Self::Relu => "relu",
            Self::Leaky => "leaky",
            Self::Tanh => "tanh",
        }
    }

    pub fn activate(self, x: f32) -> f32 {
        match self {
            Self::Linear => x,
            Self::Logistic => 1.0 / (1.0 + (-x).exp()),
            Self::Loggy => 2.0 / (1.0 + (-x).exp()) - 1.0,
            Self::Relu => x.max(0.0),
            Self::Leaky => {
                if x > 0.0 {
                    x
                } else {
                    0.1 * x
                }
            }
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative evaluated at the activated value `y`.
    pub fn gradient(self, y: f32) -> f32 {
        match self {
            Self::Linear => 1.0,
            Self::Logistic => (1.0 - y) * y,
            Self::Loggy => {
                let s = (y + 1.0) / 2.0;
                2.0 * (1.0 - s) * s
            }
            Self::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Leaky => {
                if y > 0.0 {
                    1.0
                } else {
                    0.1
                }
            }
            Self::Tanh => 1.0 - y * y,
        }
    }

    pub fn activate_slice(self, data: &mut [f32]) {
        if self == Self::Linear {
            return;
        }
        for value in data.iter_mut() {
            *value = self.activate(*value);
        }
    }

    /// Multiplies each delta by the derivative at the matching output.
    pub fn gradient_slice(self, output: &[f32], delta: &mut [f32]) {
        assert_eq!(output.len(), delta.len(), "output/delta length mismatch");
        if self == Self::Linear {
            return;
        }
        for (d, &y) in delta.iter_mut().zip(output) {
            *d *= self.gradient(y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_logistic_zero() {
        assert!((Activation::Logistic.activate(0.0) - 0.5).abs() < EPSILON);
        assert!((Activation::Logistic.gradient(0.5) - 0.25).abs() < EPSILON);
    }

    #[test]
    fn test_loggy_is_centered() {
        assert!(Activation::Loggy.activate(0.0).abs() < EPSILON);
        assert!((Activation::Loggy.gradient(0.0) - 0.5).abs() < EPSILON);
    }

    #[test]
    fn test_relu_and_leaky() {
        assert_eq!(Activation::Relu.activate(-2.0), 0.0);
        assert_eq!(Activation::Relu.activate(3.0), 3.0);
        assert_eq!(Activation::Leaky.activate(-2.0), -0.2);
        assert_eq!(Activation::Leaky.gradient(-0.2), 0.1);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let h = 1e-3f32;
        for act in [
            Activation::Logistic,
            Activation::Loggy,
            Activation::Tanh,
            Activation::Leaky,
        ] {
            for &x in &[-1.5f32, -0.3, 0.4, 2.0] {
                let numeric = (act.activate(x + h) - act.activate(x - h)) / (2.0 * h);
                let analytic = act.gradient(act.activate(x));
                assert!(
                    (numeric - analytic).abs() < 1e-2,
                    "{} at {}: numeric {} analytic {}",
                    act.name(),
                    x,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_gradient_slice_scales_delta() {
        let output = [0.5f32, 0.0];
        let mut delta = [2.0f32, 2.0];
        Activation::Logistic.gradient_slice(&output, &mut delta);
        assert!((delta[0] - 0.5).abs() < EPSILON);
        assert!(delta[1].abs() < EPSILON);
    }

    #[test]
    fn test_from_name_roundtrip() {
        for act in [
            Activation::Linear,
            Activation::Logistic,
            Activation::Loggy,
            Activation::Relu,
            Activation::Leaky,
            Activation::Tanh,
        ] {
            assert_eq!(Activation::from_name(act.name()), Some(act));
        }
        assert_eq!(Activation::from_name("swish"), None);
    }
}
