#[allow(unused)]
use crate::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Which tensor `Activation::backward` expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeArg {
    /// The pre-activation input `Z`.
    Input,
    /// The post-activation output `A`.
    Output,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Activation {
    Sigmoid,
    Tanh,
    Sqrt,
    #[serde(alias = "identity")]
    Linear,
    Relu,
    Softmax {
        #[serde(default = "unit_temperature")]
        temperature: f64,
    },
    OnePlus,
}

fn unit_temperature() -> f64 {
    1.0
}

impl Activation {
    pub const NAMES: [&'static str; 7] =
        ["sigmoid", "tanh", "sqrt", "linear", "relu", "softmax", "oneplus"];

    pub fn softmax() -> Self {
        Self::Softmax { temperature: 1.0 }
    }

    pub fn softmax_with_temperature(temperature: f64) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(NNError::InvalidActivation(format!(
                "softmax temperature must be finite and positive, got {}",
                temperature
            )));
        }
        Ok(Self::Softmax { temperature })
    }

    /// Looks up an activation by its tag.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_lowercase().as_str() {
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "sqrt" => Self::Sqrt,
            "linear" | "identity" => Self::Linear,
            "relu" => Self::Relu,
            "softmax" => Self::softmax(),
            "oneplus" => Self::OnePlus,
            other => return Err(NNError::InvalidActivation(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Sqrt => "sqrt",
            Self::Linear => "linear",
            Self::Relu => "relu",
            Self::Softmax { .. } => "softmax",
            Self::OnePlus => "oneplus",
        }
    }

    pub fn derivative_arg(&self) -> DerivativeArg {
        match self {
            Self::OnePlus => DerivativeArg::Input,
            _ => DerivativeArg::Output,
        }
    }

    pub fn forward<F: Scalar, D: Dimension>(&self, z: &Array<F, D>) -> Result<Array<F, D>> {
        Ok(match self {
            Self::Linear => z.clone(),
            Self::Sigmoid => z.mapv(sigmoid),
            Self::Tanh => z.mapv(|z| z.tanh()),
            Self::Sqrt => z.mapv(|z| z.sqrt()),
            Self::Relu => z.mapv(|z| z.max(F::zero())),
            Self::Softmax { temperature } => {
                let z2 = z.view().into_dimensionality::<Ix2>().map_err(|_| {
                    NNError::InvalidInputShape(format!(
                        "softmax expects a (batch, class) matrix, got shape {:?}",
                        z.shape()
                    ))
                })?;
                let a = if *temperature == 1.0 {
                    softmax_rows(z2)
                } else {
                    softmax_rows((&z2 / F::scal(*temperature)).view())
                };
                a.into_dimensionality::<D>()?
            }
            Self::OnePlus => z.mapv(|z| F::one() + softplus(z)),
        })
    }

    /// Derivative of the activation, evaluated on the tensor named by
    /// [`Activation::derivative_arg`].
    ///
    /// Softmax returns ones: it is only meant to be paired with a
    /// cross-entropy cost whose derivative already folds in the Jacobian.
    /// See [`softmax_jacobian_backward`] for the full contraction.
    pub fn backward<F: Scalar, D: Dimension>(&self, r: &Array<F, D>) -> Result<Array<F, D>> {
        let one = F::one();
        Ok(match self {
            Self::Sigmoid => r.mapv(|a| a * (one - a)),
            Self::Tanh => r.mapv(|a| one - a * a),
            Self::Sqrt => r.mapv(|a| one / (F::scal(2.0) * a)),
            Self::Linear | Self::Softmax { .. } => Array::ones(r.raw_dim()),
            Self::Relu => r.mapv(|a| if a > F::zero() { one } else { F::zero() }),
            Self::OnePlus => r.mapv(sigmoid),
        })
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Activation {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

fn sigmoid<F: Scalar>(z: F) -> F {
    F::one() / (F::one() + (-z).exp())
}

// ln(1 + e^z) without overflowing for large z
fn softplus<F: Scalar>(z: F) -> F {
    z.max(F::zero()) + (-z.abs()).exp().ln_1p()
}

fn softmax_rows<F: Scalar>(z: ArrayView2<F>) -> Array2<F> {
    let mut a = z.to_owned();
    for mut row in a.rows_mut() {
        let max = row.fold(F::neg_infinity(), |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    a
}

/// Backpropagates `error` through softmax using the full per-row Jacobian
/// `diag(a) - a aᵗ`, i.e. `dz = a ⊙ (e - <e, a>)`.
///
/// Not used by any layer. [`Activation::backward`] keeps the constant
/// placeholder for softmax.
pub fn softmax_jacobian_backward<F: Scalar>(
    a: ArrayView2<F>,
    error: ArrayView2<F>,
) -> Result<Array2<F>> {
    if a.shape() != error.shape() {
        return Err(NNError::LayerShapeMismatch(format!(
            "softmax output {:?} vs error {:?}",
            a.shape(),
            error.shape()
        )));
    }
    let dot = (&a * &error).sum_axis(Axis(1)).insert_axis(Axis(1));
    Ok(&a * &(&error - &dot))
}
