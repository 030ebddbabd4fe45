use rand::rngs::StdRng;
use rand::SeedableRng;
use rkl_conv::core::gradient_check::{
    gradient_check_par, gradient_check_with, numerical_gradients, numerical_gradients_par,
    DiagnosticDisplay,
};
use rkl_conv::models::ParamShape;
use rkl_conv::prelude::*;
use rkl_conv::Verdict;

fn uniform(shape: &[usize], low: f64, high: f64, rng: &mut StdRng) -> ArrayD<f64> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(low, high), rng)
}

fn randomize<N: Network<f64>>(net: &mut N, n: usize, rng: &mut StdRng) {
    let ws = Array1::random_using(n, Uniform::new(-1.0, 1.0), rng);
    net.set_weights(ws.view()).unwrap();
}

fn conv_pool(rng: &mut StdRng) -> Sequential<f64> {
    let mut net = Sequential::builder(&[1, 8, 8])
        .add_conv(4, 3, 3, Activation::Sigmoid)
        .unwrap()
        .add_pool(2)
        .unwrap()
        .loss(Loss::MSE)
        .build()
        .unwrap();
    let n = net.count_parameters();
    randomize(&mut net, n, rng);
    net
}

fn one_hot(rows: usize, classes: usize, rng: &mut StdRng) -> ArrayD<f64> {
    use rand::Rng;
    let mut y = Array2::<f64>::zeros((rows, classes));
    for mut row in y.rows_mut() {
        row[rng.gen_range(0..classes)] = 1.0;
    }
    y.into_dyn()
}

#[test]
fn conv_pool_network_passes_gradient_check() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut net = conv_pool(&mut rng);
    let x = uniform(&[2, 1, 8, 8], -1.0, 1.0, &mut rng);
    let y = uniform(&[2, 4, 3, 3], 0.0, 1.0, &mut rng);

    let weights_before = net.get_weights();
    let config = GradientCheckConfig::default().with_epsilon(1e-4);
    let report = rkl_conv::gradient_check(&mut net, &x, &y, &config).unwrap();

    assert!(report.passed(), "relative error {:e}", report.relative_error);
    assert!(report.relative_error < 1e-5);
    assert!(report.diagnostics.is_empty());
    assert_eq!(net.get_weights(), weights_before);
}

#[test]
fn conv_bias_gradient_is_checked() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut net = conv_pool(&mut rng);
    let x = uniform(&[2, 1, 8, 8], -1.0, 1.0, &mut rng);
    let y = uniform(&[2, 4, 3, 3], 0.0, 1.0, &mut rng);
    let config = GradientCheckConfig::default().with_epsilon(1e-4);
    let report = rkl_conv::gradient_check(&mut net, &x, &y, &config).unwrap();

    // biases are the last four coordinates
    let n = report.analytic.len();
    let bias_grad = report.analytic.slice(s![n - 4..]);
    assert!(bias_grad.iter().any(|g| g.abs() > 1e-8));
    for (a, num) in bias_grad.iter().zip(report.numeric.slice(s![n - 4..])) {
        assert!((a - num).abs() < 1e-6);
    }
}

#[test]
fn conv_flatten_dense_stack_passes() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut net = Sequential::builder(&[2, 5, 5])
        .add_conv(3, 2, 2, Activation::Tanh)
        .unwrap()
        .add_flatten()
        .unwrap()
        .add_dense(4, Activation::Sigmoid)
        .unwrap()
        .loss(Loss::MSE)
        .build()
        .unwrap();
    let n = net.count_parameters();
    randomize(&mut net, n, &mut rng);
    let x = uniform(&[3, 2, 5, 5], -1.0, 1.0, &mut rng);
    let y = uniform(&[3, 4], 0.0, 1.0, &mut rng);

    let report = rkl_conv::gradient_check(&mut net, &x, &y, &GradientCheckConfig::default()).unwrap();
    assert!(report.passed(), "relative error {:e}", report.relative_error);
}

#[test]
fn softmax_with_cross_entropy_passes() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut net = Sequential::builder(&[5])
        .add_dense(6, Activation::Tanh)
        .unwrap()
        .add_dense(3, Activation::softmax())
        .unwrap()
        .loss(Loss::Xent)
        .build()
        .unwrap();
    let n = net.count_parameters();
    randomize(&mut net, n, &mut rng);
    let x = uniform(&[4, 5], -1.0, 1.0, &mut rng);
    let y = one_hot(4, 3, &mut rng);

    let report = rkl_conv::gradient_check(&mut net, &x, &y, &GradientCheckConfig::default()).unwrap();
    assert!(report.passed(), "relative error {:e}", report.relative_error);
}

#[test]
fn tempered_softmax_is_only_approximate_with_placeholder_derivative() {
    // The placeholder derivative ignores the 1/T factor, so the check must catch it.
    let mut rng = StdRng::seed_from_u64(8);
    let mut net = Sequential::builder(&[4])
        .add_dense(3, Activation::softmax_with_temperature(4.0).unwrap())
        .unwrap()
        .loss(Loss::Xent)
        .build()
        .unwrap();
    let n = net.count_parameters();
    randomize(&mut net, n, &mut rng);
    let x = uniform(&[3, 4], -1.0, 1.0, &mut rng);
    let y = one_hot(3, 3, &mut rng);

    let config = GradientCheckConfig::default().with_display(false);
    let report = rkl_conv::gradient_check(&mut net, &x, &y, &config).unwrap();
    assert_eq!(report.verdict, Verdict::Fatal);
    // analytic gradient is exactly T times the true one
    for (a, num) in report.analytic.iter().zip(report.numeric.iter()) {
        assert!((a - 4.0 * num).abs() < 1e-6);
    }
}

#[test]
fn oneplus_and_linear_pass() {
    let mut rng = StdRng::seed_from_u64(21);
    let mut net = Sequential::builder(&[4])
        .add_dense(3, Activation::OnePlus)
        .unwrap()
        .add_dense(2, "identity".parse().unwrap())
        .unwrap()
        .loss(Loss::MSE)
        .build()
        .unwrap();
    let n = net.count_parameters();
    randomize(&mut net, n, &mut rng);
    let x = uniform(&[5, 4], -2.0, 2.0, &mut rng);
    let y = uniform(&[5, 2], -1.0, 1.0, &mut rng);

    let report = rkl_conv::gradient_check(&mut net, &x, &y, &GradientCheckConfig::default()).unwrap();
    assert!(report.passed(), "relative error {:e}", report.relative_error);
}

#[test]
fn parallel_numerical_gradients_match_sequential() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut net = conv_pool(&mut rng);
    let x = uniform(&[2, 1, 8, 8], -1.0, 1.0, &mut rng);
    let y = uniform(&[2, 4, 3, 3], 0.0, 1.0, &mut rng);

    let par = numerical_gradients_par(&net, &x, &y, 1e-4).unwrap();
    let seq = numerical_gradients(&mut net, &x, &y, 1e-4).unwrap();
    assert_eq!(par.len(), seq.len());
    for (p, s) in par.iter().zip(seq.iter()) {
        assert!((p - s).abs() < 1e-12);
    }

    let config = GradientCheckConfig::default().with_epsilon(1e-4);
    assert!(gradient_check_par(&mut net, &x, &y, &config).unwrap().passed());
}

/// Delegates to a `Sequential`, optionally failing on a given predict call
/// or corrupting the analytical gradient.
struct Faulty {
    inner: Sequential<f64>,
    predictions: usize,
    fail_at: Option<usize>,
    gradient_scale: f64,
}

impl Network<f64> for Faulty {
    fn predict(&mut self, x: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.predictions += 1;
        if Some(self.predictions) == self.fail_at {
            return Err(NNError::ComputationError("injected".to_string()));
        }
        self.inner.predict(x)
    }

    fn cost(&self, prediction: &ArrayD<f64>, target: &ArrayD<f64>) -> Result<f64> {
        self.inner.cost(prediction, target)
    }

    fn cost_derivative(&self, prediction: &ArrayD<f64>, target: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.inner.cost_derivative(prediction, target)
    }

    fn backpropagate(&mut self, error: ArrayD<f64>) -> Result<()> {
        self.inner.backpropagate(error)
    }

    fn get_weights(&self) -> Array1<f64> {
        self.inner.get_weights()
    }

    fn set_weights(&mut self, ws: ArrayView1<f64>) -> Result<()> {
        self.inner.set_weights(ws)
    }

    fn get_gradients(&self) -> Array1<f64> {
        self.inner.get_gradients() * self.gradient_scale
    }

    fn param_shapes(&self) -> Vec<ParamShape> {
        self.inner.param_shapes()
    }
}

#[test]
fn weights_are_restored_when_a_perturbed_pass_fails() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut net = Faulty {
        inner: conv_pool(&mut rng),
        predictions: 0,
        fail_at: Some(7),
        gradient_scale: 1.0,
    };
    let x = uniform(&[1, 1, 8, 8], -1.0, 1.0, &mut rng);
    let y = uniform(&[1, 4, 3, 3], 0.0, 1.0, &mut rng);
    let before = net.get_weights();

    let result = numerical_gradients(&mut net, &x, &y, 1e-4);
    assert!(matches!(result, Err(NNError::ComputationError(_))));
    assert_eq!(net.get_weights(), before);
}

#[derive(Default)]
struct Recorder {
    shapes: Vec<Vec<usize>>,
}

impl DiagnosticDisplay for Recorder {
    fn display(&mut self, index: usize, diff: ArrayViewD<'_, f64>) {
        assert_eq!(index, self.shapes.len());
        self.shapes.push(diff.shape().to_vec());
    }
}

#[test]
fn broken_gradients_fail_with_diagnostics() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut net = Faulty {
        inner: conv_pool(&mut rng),
        predictions: 0,
        fail_at: None,
        gradient_scale: 2.0,
    };
    let x = uniform(&[2, 1, 8, 8], -1.0, 1.0, &mut rng);
    let y = uniform(&[2, 4, 3, 3], 0.0, 1.0, &mut rng);

    let mut recorder = Recorder::default();
    let config = GradientCheckConfig::default().with_epsilon(1e-4);
    let report = gradient_check_with(&mut net, &x, &y, &config, &mut recorder).unwrap();

    assert!(!report.passed());
    assert_eq!(report.verdict, Verdict::Fatal);
    // conv weights (4, 1, 3, 3) squeezed to (4, 3, 3), biases (4,)
    assert_eq!(recorder.shapes, vec![vec![4, 3, 3], vec![4]]);
    assert_eq!(report.diagnostics.len(), 2);
}

#[test]
fn single_precision_check_still_runs() {
    let mut net = Sequential::<f32>::builder(&[3])
        .add_dense(2, Activation::Sigmoid)
        .unwrap()
        .loss(Loss::MSE)
        .build()
        .unwrap();
    let x = Array2::<f32>::from_elem((2, 3), 0.5).into_dyn();
    let y = Array2::<f32>::from_elem((2, 2), 0.25).into_dyn();
    let config = GradientCheckConfig::default().with_epsilon(1e-2);
    let report = rkl_conv::gradient_check(&mut net, &x, &y, &config).unwrap();
    assert_eq!(report.analytic.len(), 8);
    assert!(report.relative_error.is_finite());
}
