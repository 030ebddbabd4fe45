//! Numerical-vs-analytical gradient comparison.
//!
//! The network is treated as a black box through [`Network`]. Every
//! coordinate of the unfolded parameter vector is perturbed by `±epsilon`
//! and the central difference of the cost is compared with the gradient
//! left behind by one backward pass.

use crate::models::{Network, ParamShape};
use crate::prelude::*;
use rayon::prelude::*;
use std::fmt;
use tracing::{debug, info, trace, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GradientCheckConfig {
    /// Perturbation applied to each parameter.
    pub epsilon: f64,
    /// Hand difference matrices to the display collaborator when the check fails.
    pub display: bool,
    pub verbose: bool,
}

impl Default for GradientCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            display: true,
            verbose: true,
        }
    }
}

impl GradientCheckConfig {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_display(mut self, display: bool) -> Self {
        self.display = display;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// error < 1e-7
    Passed,
    /// 1e-7 <= error < 1e-5
    Suspicious,
    /// 1e-5 <= error < 1e-3
    Failed,
    /// error >= 1e-3
    Fatal,
}

impl Verdict {
    pub fn from_error(relative_error: f64) -> Self {
        if relative_error < 1e-7 {
            Self::Passed
        } else if relative_error < 1e-5 {
            Self::Suspicious
        } else if relative_error < 1e-3 {
            Self::Failed
        } else {
            // NaN lands here as well
            Self::Fatal
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed | Self::Suspicious)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Self::Passed => "Gradient check passed, error < 1e-7",
            Self::Suspicious => "Suspicious gradients, 1e-7 < error < 1e-5",
            Self::Failed => "Gradient check failed, 1e-5 < error < 1e-3",
            Self::Fatal => "Fatal fail in gradient check, error > 1e-3",
        };
        write!(f, "{}", msg)
    }
}

#[derive(Debug, Clone)]
pub struct GradientCheckReport {
    pub relative_error: f64,
    pub verdict: Verdict,
    pub analytic: Array1<f64>,
    pub numeric: Array1<f64>,
    /// `|analytic - numeric|` folded into each trainable layer's weight and
    /// bias shapes. Only filled for failing checks with `display` enabled.
    pub diagnostics: Vec<ArrayD<f64>>,
}

impl GradientCheckReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Receives the difference matrices of a failed check.
pub trait DiagnosticDisplay {
    fn display(&mut self, index: usize, diff: ArrayViewD<'_, f64>);
}

/// Logs each difference matrix through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDisplay;

impl DiagnosticDisplay for TracingDisplay {
    fn display(&mut self, index: usize, diff: ArrayViewD<'_, f64>) {
        info!("Sum of difference matrix no {}: {:.4e}", index, diff.sum());
        debug!("difference matrix no {}:\n{:.3e}", index, diff);
    }
}

/// Puts the original weights back when dropped, whichever way the
/// perturbation loop is left.
struct RestoreWeights<'a, F: Scalar, N: Network<F>> {
    network: &'a mut N,
    original: Array1<F>,
}

impl<F: Scalar, N: Network<F>> Drop for RestoreWeights<'_, F, N> {
    fn drop(&mut self) {
        if let Err(err) = self.network.set_weights(self.original.view()) {
            warn!("failed to restore weights after gradient check: {}", err);
        }
    }
}

fn perturbed_cost<F: Scalar, N: Network<F>>(
    network: &mut N,
    ws: &Array1<F>,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
) -> Result<F> {
    network.set_weights(ws.view())?;
    let prediction = network.predict(x)?;
    network.cost(&prediction, y)
}

pub fn numerical_gradients<F: Scalar, N: Network<F>>(
    network: &mut N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    epsilon: f64,
) -> Result<Array1<F>> {
    let ws = network.get_weights();
    let nparams = ws.len();
    let eps = F::scal(epsilon);
    let two_eps = F::scal(2.0) * eps;

    let guard = RestoreWeights {
        network,
        original: ws.clone(),
    };
    let mut numgrads = Array1::<F>::zeros(nparams);
    let mut perturbed = ws.clone();

    debug!("Calculating numerical gradients over {} parameters...", nparams);
    for i in 0..nparams {
        trace!("{} / {}", i + 1, nparams);
        perturbed[i] = ws[i] + eps;
        let cost1 = perturbed_cost(&mut *guard.network, &perturbed, x, y)?;
        perturbed[i] = ws[i] - eps;
        let cost2 = perturbed_cost(&mut *guard.network, &perturbed, x, y)?;
        perturbed[i] = ws[i];
        numgrads[i] = (cost1 - cost2) / two_eps;
    }
    drop(guard);
    debug!("Numerical gradients done");

    Ok(numgrads)
}

/// Same as [`numerical_gradients`], spread over the rayon pool. Each worker
/// perturbs its own clone, so `network` is never modified.
pub fn numerical_gradients_par<F, N>(
    network: &N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    epsilon: f64,
) -> Result<Array1<F>>
where
    F: Scalar,
    N: Network<F> + Clone + Send + Sync,
{
    let ws = network.get_weights();
    let nparams = ws.len();
    let eps = F::scal(epsilon);
    let two_eps = F::scal(2.0) * eps;

    debug!(
        "Calculating numerical gradients over {} parameters on {} threads...",
        nparams,
        rayon::current_num_threads()
    );
    let numgrads = (0..nparams)
        .into_par_iter()
        .map_init(
            || (network.clone(), ws.clone()),
            |(net, perturbed), i| -> Result<F> {
                perturbed[i] = ws[i] + eps;
                let cost1 = perturbed_cost(net, perturbed, x, y);
                perturbed[i] = ws[i] - eps;
                let cost2 = perturbed_cost(net, perturbed, x, y);
                perturbed[i] = ws[i];
                Ok((cost1? - cost2?) / two_eps)
            },
        )
        .collect::<Result<Vec<F>>>()?;

    Ok(Array1::from(numgrads))
}

pub fn analytical_gradients<F: Scalar, N: Network<F>>(
    network: &mut N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
) -> Result<Array1<F>> {
    debug!("Calculating analytical gradients...");
    let preds = network.predict(x)?;
    let delta = network.cost_derivative(&preds, y)?;
    network.backpropagate(delta)?;
    Ok(network.get_gradients())
}

/// `‖a - n‖ / max(‖a‖, ‖n‖)`; zero when both vectors are zero.
pub fn relative_error(analytic: ArrayView1<f64>, numeric: ArrayView1<f64>) -> f64 {
    let norm = |v: ArrayView1<f64>| v.dot(&v).sqrt();
    let diff = &analytic - &numeric;
    let denom = norm(analytic).max(norm(numeric));
    if denom == 0.0 {
        return norm(diff.view());
    }
    norm(diff.view()) / denom
}

/// Splits `dvec` into the weight and bias matrices of each trainable layer,
/// dropping axes of length one.
pub fn fold_difference_matrices(
    dvec: ArrayView1<f64>,
    shapes: &[ParamShape],
) -> Result<Vec<ArrayD<f64>>> {
    let mut diffs = Vec::new();
    let mut start = 0;
    for shape in shapes.iter().filter(|s| s.trainable) {
        for dims in [&shape.weights, &shape.biases] {
            let size = dims.iter().product::<usize>();
            if start + size > dvec.len() {
                return Err(NNError::InvalidWeightShape(format!(
                    "difference vector of length {} is too short for layer {}",
                    dvec.len(),
                    shape.layer
                )));
            }
            let squeezed: Vec<usize> = dims.iter().copied().filter(|&d| d != 1).collect();
            let block = dvec.slice(s![start..start + size]).to_owned();
            diffs.push(block.into_shape_with_order(IxDyn(&squeezed))?);
            start += size;
        }
    }
    Ok(diffs)
}

pub fn gradient_check<F: Scalar, N: Network<F>>(
    network: &mut N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    config: &GradientCheckConfig,
) -> Result<GradientCheckReport> {
    gradient_check_with(network, x, y, config, &mut TracingDisplay)
}

/// Like [`gradient_check`], but hands the difference matrices of a failing
/// check to `display`.
///
/// A failing check is not an error: it is reported through the verdict.
/// `Err` only carries errors raised by the network itself.
pub fn gradient_check_with<F: Scalar, N: Network<F>>(
    network: &mut N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    config: &GradientCheckConfig,
    display: &mut dyn DiagnosticDisplay,
) -> Result<GradientCheckReport> {
    warn_precision::<F>();
    let analytic = analytical_gradients(network, x, y)?;
    let numeric = numerical_gradients(network, x, y, config.epsilon)?;
    finish(analytic, numeric, &network.param_shapes(), config, display)
}

/// Gradient check with the numerical half computed by
/// [`numerical_gradients_par`].
pub fn gradient_check_par<F, N>(
    network: &mut N,
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    config: &GradientCheckConfig,
) -> Result<GradientCheckReport>
where
    F: Scalar,
    N: Network<F> + Clone + Send + Sync,
{
    warn_precision::<F>();
    let analytic = analytical_gradients(network, x, y)?;
    let numeric = numerical_gradients_par(&*network, x, y, config.epsilon)?;
    finish(
        analytic,
        numeric,
        &network.param_shapes(),
        config,
        &mut TracingDisplay,
    )
}

fn warn_precision<F: Scalar>() {
    if F::PRECISION != Precision::Double {
        warn!("Performing gradient check on {} precision!", F::PRECISION);
    }
}

fn finish<F: Scalar>(
    analytic: Array1<F>,
    numeric: Array1<F>,
    shapes: &[ParamShape],
    config: &GradientCheckConfig,
    display: &mut dyn DiagnosticDisplay,
) -> Result<GradientCheckReport> {
    let analytic = analytic.mapv(<F as Scalar>::to_f64);
    let numeric = numeric.mapv(<F as Scalar>::to_f64);
    let error = relative_error(analytic.view(), numeric.view());
    let verdict = Verdict::from_error(error);

    if config.verbose {
        if verdict.passed() {
            info!("Result of gradient check: {} ({:.1e})", verdict, error);
        } else {
            warn!("Result of gradient check: {} ({:.1e})", verdict, error);
        }
    }

    let mut diagnostics = Vec::new();
    if config.display && !verdict.passed() {
        let diff = (&analytic - &numeric).mapv(f64::abs);
        diagnostics = fold_difference_matrices(diff.view(), shapes)?;
        for (i, d) in diagnostics.iter().enumerate() {
            display.display(i, d.view());
        }
    }

    Ok(GradientCheckReport {
        relative_error: error,
        verdict,
        analytic,
        numeric,
        diagnostics,
    })
}
