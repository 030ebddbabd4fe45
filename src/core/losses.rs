use crate::prelude::*;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Loss {
    /// `0.5 * sum((a - y)^2) / m`
    MSE,
    /// Categorical cross-entropy `-sum(y * ln a) / m`. Its derivative assumes a
    /// softmax output layer and already contains the softmax Jacobian.
    Xent,
}

impl Loss {
    pub fn cost<F: Scalar>(&self, y_hat: &ArrayD<F>, y: &ArrayD<F>) -> Result<F> {
        check_shapes(y_hat, y)?;
        let m = batch_size::<F>(y_hat);
        Ok(match self {
            Self::MSE => {
                let sq = Zip::from(y_hat).and(y).fold(F::zero(), |acc, &a, &t| {
                    let d = a - t;
                    acc + d * d
                });
                F::scal(0.5) * sq / m
            }
            Self::Xent => {
                let tiny = F::min_positive_value();
                let ll = Zip::from(y_hat)
                    .and(y)
                    .fold(F::zero(), |acc, &a, &t| acc + t * a.max(tiny).ln());
                -ll / m
            }
        })
    }

    pub fn derivative<F: Scalar>(&self, y_hat: &ArrayD<F>, y: &ArrayD<F>) -> Result<ArrayD<F>> {
        check_shapes(y_hat, y)?;
        let m = batch_size::<F>(y_hat);
        // identical for both: Xent's derivative is taken w.r.t. the softmax input
        Ok((y_hat - y) / m)
    }
}

impl FromStr for Loss {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mse" => Ok(Self::MSE),
            "xent" | "cxent" | "cross_entropy" => Ok(Self::Xent),
            other => Err(NNError::InvalidLoss(other.to_string())),
        }
    }
}

fn check_shapes<F: Scalar>(y_hat: &ArrayD<F>, y: &ArrayD<F>) -> Result<()> {
    if y_hat.shape() != y.shape() {
        return Err(NNError::LayerShapeMismatch(format!(
            "Prediction shape {:?} doesn't match target shape {:?}",
            y_hat.shape(),
            y.shape()
        )));
    }
    Ok(())
}

fn batch_size<F: Scalar>(a: &ArrayD<F>) -> F {
    F::scal(a.shape().first().copied().unwrap_or(1).max(1) as f64)
}
