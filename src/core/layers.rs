use crate::core::activations::{Activation, DerivativeArg};
use crate::core::tensor_ops::{ConvMode, ConvolutionOp, MaxPoolOp, PoolMask};
use crate::prelude::*;
use crate::utils::{rtm, white};
use tracing::debug;

/// Borrowed parameters (or their gradients) of a trainable layer.
pub struct ParamView<'a, F> {
    pub weights: ArrayViewD<'a, F>,
    pub biases: ArrayViewD<'a, F>,
}

pub struct ParamViewMut<'a, F> {
    pub weights: ArrayViewMutD<'a, F>,
    pub biases: ArrayViewMutD<'a, F>,
}

/// A connectable network node.
///
/// Shapes passed to [`LayerTrait::connect`] and returned by it exclude the
/// batch axis. `backpropagate` must run after a `feedforward` and leaves the
/// parameter gradients of trainable layers overwritten.
pub trait LayerTrait<F: Scalar>: Send + Sync {
    fn connect(&mut self, inshape: &[usize]) -> Result<Vec<usize>>;

    fn feedforward(&mut self, x: ArrayD<F>) -> Result<ArrayD<F>>;

    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<ArrayD<F>>;

    fn outshape(&self) -> &[usize];

    fn typ(&self) -> String;

    fn trainable(&self) -> bool {
        false
    }

    fn params(&self) -> Option<ParamView<'_, F>> {
        None
    }

    fn params_mut(&mut self) -> Option<ParamViewMut<'_, F>> {
        None
    }

    fn gradients(&self) -> Option<ParamView<'_, F>> {
        None
    }

    fn box_clone(&self) -> Box<dyn LayerTrait<F>>;
}

impl<F: Scalar> Clone for Box<dyn LayerTrait<F>> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

fn spatial_inshape(typ: &str, inshape: &[usize]) -> Result<(usize, usize, usize)> {
    match *inshape {
        [c, iy, ix] => Ok((c, iy, ix)),
        _ => Err(NNError::InvalidLayerConfiguration(format!(
            "{} expects a (channel, height, width) input, got {:?}",
            typ, inshape
        ))),
    }
}

fn checked_input<F: Scalar, D: Dimension>(x: ArrayD<F>, inshape: &[usize]) -> Result<Array<F, D>> {
    if x.ndim() != inshape.len() + 1 || &x.shape()[1..] != inshape {
        return Err(NNError::InvalidInputShape(format!(
            "expected (batch, {:?}), got {:?}",
            inshape,
            x.shape()
        )));
    }
    Ok(x.into_dimensionality::<D>()?)
}

fn checked_error<F: Scalar, D: Dimension>(error: ArrayD<F>, output: &[usize]) -> Result<Array<F, D>> {
    if error.shape() != output {
        return Err(NNError::LayerShapeMismatch(format!(
            "error {:?} does not match layer output {:?}",
            error.shape(),
            output
        )));
    }
    Ok(error.into_dimensionality::<D>()?)
}

#[derive(Debug, Clone)]
struct Cache<F, D: Dimension> {
    inputs: Array<F, D>,
    z: Array<F, D>,
    output: Array<F, D>,
}

impl<F: Scalar, D: Dimension> Cache<F, D> {
    /// Incoming error times the activation derivative.
    fn delta(&self, activation: &Activation, error: Array<F, D>) -> Result<Array<F, D>> {
        let reference = match activation.derivative_arg() {
            DerivativeArg::Input => &self.z,
            DerivativeArg::Output => &self.output,
        };
        let mut delta = activation.backward(reference)?;
        delta *= &error;
        Ok(delta)
    }
}

#[derive(Debug, Clone)]
pub struct ConvLayer<F: Scalar> {
    pub nfilters: usize,
    pub fy: usize,
    pub fx: usize,
    pub activation: Activation,
    pub weights: Array4<F>,
    pub biases: Array1<F>,
    pub nabla_w: Array4<F>,
    pub nabla_b: Array1<F>,
    inshape: Vec<usize>,
    outshape: Vec<usize>,
    cache: Option<Cache<F, Ix4>>,
    op: ConvolutionOp,
}

impl<F: Scalar> ConvLayer<F> {
    pub fn new(nfilters: usize, filtery: usize, filterx: usize, activation: Activation) -> Result<Self> {
        if nfilters == 0 || filtery == 0 || filterx == 0 {
            return Err(NNError::InvalidLayerConfiguration(
                "Layer dimensions must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            nfilters,
            fy: filtery,
            fx: filterx,
            activation,
            weights: Array4::zeros((0, 0, 0, 0)),
            biases: Array1::zeros(0),
            nabla_w: Array4::zeros((0, 0, 0, 0)),
            nabla_b: Array1::zeros(0),
            inshape: Vec::new(),
            outshape: Vec::new(),
            cache: None,
            op: ConvolutionOp,
        })
    }
}

impl<F: Scalar> LayerTrait<F> for ConvLayer<F> {
    fn connect(&mut self, inshape: &[usize]) -> Result<Vec<usize>> {
        let (depth, iy, ix) = spatial_inshape("ConvLayer", inshape)?;
        if let Activation::Softmax { .. } = self.activation {
            return Err(NNError::InvalidLayerConfiguration(
                "softmax needs a (batch, class) output; use it on a DenseLayer".to_string(),
            ));
        }
        if iy < self.fy || ix < self.fx {
            return Err(NNError::InvalidLayerConfiguration(format!(
                "Incompatible shapes: iy ({}) < fy ({}) OR ix ({}) < fx ({})",
                iy, self.fy, ix, self.fx
            )));
        }
        self.weights = white::<F>(&[self.nfilters, depth, self.fy, self.fx])?
            .into_dimensionality::<Ix4>()?;
        self.biases = Array1::zeros(self.nfilters);
        self.nabla_w = Array4::zeros(self.weights.raw_dim());
        self.nabla_b = Array1::zeros(self.nfilters);
        self.inshape = inshape.to_vec();
        self.outshape = vec![self.nfilters, iy - self.fy + 1, ix - self.fx + 1];
        self.cache = None;
        debug!("connected {} {:?} -> {:?}", self.typ(), self.inshape, self.outshape);
        Ok(self.outshape.clone())
    }

    fn feedforward(&mut self, x: ArrayD<F>) -> Result<ArrayD<F>> {
        let inputs: Array4<F> = checked_input(x, &self.inshape)?;
        let mut z = self.op.apply(inputs.view(), self.weights.view(), ConvMode::Valid)?;
        z += &self
            .biases
            .view()
            .into_shape_with_order((1, self.nfilters, 1, 1))?;
        let output = self.activation.forward(&z)?;
        self.cache = Some(Cache {
            inputs,
            z,
            output: output.clone(),
        });
        Ok(output.into_dyn())
    }

    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<ArrayD<F>> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            NNError::ComputationError("ConvLayer backpropagated before feedforward".to_string())
        })?;
        let error: Array4<F> = checked_error(error, cache.output.shape())?;
        let delta = cache.delta(&self.activation, error)?;
        self.nabla_w = self.op.weight_gradient(cache.inputs.view(), delta.view())?;
        self.nabla_b = delta
            .sum_axis(Axis(3))
            .sum_axis(Axis(2))
            .sum_axis(Axis(0));
        Ok(self.op.input_error(delta.view(), self.weights.view())?.into_dyn())
    }

    fn outshape(&self) -> &[usize] {
        &self.outshape
    }

    fn typ(&self) -> String {
        let act = self.activation.to_string();
        format!(
            "Conv({}x{}x{})-{}",
            self.nfilters,
            self.fy,
            self.fx,
            &act[..act.len().min(4)]
        )
    }

    fn trainable(&self) -> bool {
        true
    }

    fn params(&self) -> Option<ParamView<'_, F>> {
        Some(ParamView {
            weights: self.weights.view().into_dyn(),
            biases: self.biases.view().into_dyn(),
        })
    }

    fn params_mut(&mut self) -> Option<ParamViewMut<'_, F>> {
        Some(ParamViewMut {
            weights: self.weights.view_mut().into_dyn(),
            biases: self.biases.view_mut().into_dyn(),
        })
    }

    fn gradients(&self) -> Option<ParamView<'_, F>> {
        Some(ParamView {
            weights: self.nabla_w.view().into_dyn(),
            biases: self.nabla_b.view().into_dyn(),
        })
    }

    fn box_clone(&self) -> Box<dyn LayerTrait<F>> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PoolLayer {
    pub fdim: usize,
    inshape: Vec<usize>,
    outshape: Vec<usize>,
    filter: Option<PoolMask>,
    op: MaxPoolOp,
}

impl PoolLayer {
    pub fn new(fdim: usize) -> Result<Self> {
        if fdim == 0 {
            return Err(NNError::InvalidLayerConfiguration(
                "Pool window must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            fdim,
            inshape: Vec::new(),
            outshape: Vec::new(),
            filter: None,
            op: MaxPoolOp,
        })
    }
}

impl<F: Scalar> LayerTrait<F> for PoolLayer {
    fn connect(&mut self, inshape: &[usize]) -> Result<Vec<usize>> {
        let (ic, iy, ix) = spatial_inshape("PoolLayer", inshape)?;
        if iy % self.fdim != 0 || ix % self.fdim != 0 {
            return Err(NNError::InvalidLayerConfiguration(format!(
                "Incompatible shapes: {:?} % {}",
                (iy, ix),
                self.fdim
            )));
        }
        self.inshape = inshape.to_vec();
        self.outshape = vec![ic, iy / self.fdim, ix / self.fdim];
        self.filter = None;
        debug!("connected Pool-{0}x{0} {1:?} -> {2:?}", self.fdim, self.inshape, self.outshape);
        Ok(self.outshape.clone())
    }

    fn feedforward(&mut self, x: ArrayD<F>) -> Result<ArrayD<F>> {
        let x: Array4<F> = checked_input(x, &self.inshape)?;
        let (output, filter) = self.op.apply(x.view(), self.fdim)?;
        self.filter = Some(filter);
        Ok(output.into_dyn())
    }

    /// Consumes the mask recorded by the last `feedforward`.
    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<ArrayD<F>> {
        let filter = self.filter.take().ok_or_else(|| {
            NNError::ComputationError(
                "PoolLayer has no mask; feedforward must precede every backpropagate".to_string(),
            )
        })?;
        let (n, c, oy, ox) = filter.output_dim();
        let error: Array4<F> = checked_error(error, &[n, c, oy, ox])?;
        Ok(self.op.backward(error.view(), &filter)?.into_dyn())
    }

    fn outshape(&self) -> &[usize] {
        &self.outshape
    }

    fn typ(&self) -> String {
        format!("Pool-{}x{}", self.fdim, self.fdim)
    }

    fn box_clone(&self) -> Box<dyn LayerTrait<F>> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DenseLayer<F: Scalar> {
    pub neurons: usize,
    pub activation: Activation,
    pub weights: Array2<F>,
    pub biases: Array1<F>,
    pub nabla_w: Array2<F>,
    pub nabla_b: Array1<F>,
    inshape: Vec<usize>,
    outshape: Vec<usize>,
    cache: Option<Cache<F, Ix2>>,
}

impl<F: Scalar> DenseLayer<F> {
    pub fn new(neurons: usize, activation: Activation) -> Result<Self> {
        if neurons == 0 {
            return Err(NNError::InvalidLayerConfiguration(
                "Layer dimensions must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            neurons,
            activation,
            weights: Array2::zeros((0, 0)),
            biases: Array1::zeros(0),
            nabla_w: Array2::zeros((0, 0)),
            nabla_b: Array1::zeros(0),
            inshape: Vec::new(),
            outshape: vec![neurons],
            cache: None,
        })
    }
}

impl<F: Scalar> LayerTrait<F> for DenseLayer<F> {
    fn connect(&mut self, inshape: &[usize]) -> Result<Vec<usize>> {
        let fanin = match *inshape {
            [fanin] if fanin > 0 => fanin,
            _ => {
                return Err(NNError::InvalidLayerConfiguration(format!(
                    "DenseLayer expects a flat input, got {:?}; add a FlattenLayer first",
                    inshape
                )))
            }
        };
        self.weights = white::<F>(&[fanin, self.neurons])?.into_dimensionality::<Ix2>()?;
        self.biases = Array1::zeros(self.neurons);
        self.nabla_w = Array2::zeros((fanin, self.neurons));
        self.nabla_b = Array1::zeros(self.neurons);
        self.inshape = inshape.to_vec();
        self.cache = None;
        debug!("connected {} {:?} -> {:?}", self.typ(), self.inshape, self.outshape);
        Ok(self.outshape.clone())
    }

    fn feedforward(&mut self, x: ArrayD<F>) -> Result<ArrayD<F>> {
        let inputs: Array2<F> = checked_input(x, &self.inshape)?;
        let z = inputs.dot(&self.weights) + &self.biases;
        let output = self.activation.forward(&z)?;
        self.cache = Some(Cache {
            inputs,
            z,
            output: output.clone(),
        });
        Ok(output.into_dyn())
    }

    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<ArrayD<F>> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            NNError::ComputationError("DenseLayer backpropagated before feedforward".to_string())
        })?;
        let error: Array2<F> = checked_error(error, cache.output.shape())?;
        let delta = cache.delta(&self.activation, error)?;
        self.nabla_w = cache.inputs.t().dot(&delta);
        self.nabla_b = delta.sum_axis(Axis(0));
        Ok(delta.dot(&self.weights.t()).into_dyn())
    }

    fn outshape(&self) -> &[usize] {
        &self.outshape
    }

    fn typ(&self) -> String {
        let act = self.activation.to_string();
        format!("Dense({})-{}", self.neurons, &act[..act.len().min(4)])
    }

    fn trainable(&self) -> bool {
        true
    }

    fn params(&self) -> Option<ParamView<'_, F>> {
        Some(ParamView {
            weights: self.weights.view().into_dyn(),
            biases: self.biases.view().into_dyn(),
        })
    }

    fn params_mut(&mut self) -> Option<ParamViewMut<'_, F>> {
        Some(ParamViewMut {
            weights: self.weights.view_mut().into_dyn(),
            biases: self.biases.view_mut().into_dyn(),
        })
    }

    fn gradients(&self) -> Option<ParamView<'_, F>> {
        Some(ParamView {
            weights: self.nabla_w.view().into_dyn(),
            biases: self.nabla_b.view().into_dyn(),
        })
    }

    fn box_clone(&self) -> Box<dyn LayerTrait<F>> {
        Box::new(self.clone())
    }
}

/// Reshapes `(batch, ...)` to `(batch, features)`.
#[derive(Debug, Clone, Default)]
pub struct FlattenLayer {
    inshape: Vec<usize>,
    outshape: Vec<usize>,
}

impl FlattenLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<F: Scalar> LayerTrait<F> for FlattenLayer {
    fn connect(&mut self, inshape: &[usize]) -> Result<Vec<usize>> {
        if inshape.is_empty() {
            return Err(NNError::InvalidLayerConfiguration(
                "FlattenLayer needs at least one feature axis".to_string(),
            ));
        }
        self.inshape = inshape.to_vec();
        self.outshape = vec![inshape.iter().product()];
        Ok(self.outshape.clone())
    }

    fn feedforward(&mut self, x: ArrayD<F>) -> Result<ArrayD<F>> {
        let x: ArrayD<F> = checked_input(x, &self.inshape)?;
        Ok(rtm(&x)?.into_dyn())
    }

    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<ArrayD<F>> {
        let n = error.shape().first().copied().unwrap_or(0);
        let features = self.inshape.iter().product::<usize>();
        let error: ArrayD<F> = checked_error(error, &[n, features])?;
        let mut shape = vec![n];
        shape.extend_from_slice(&self.inshape);
        Ok(error.to_shape(IxDyn(&shape))?.into_owned())
    }

    fn outshape(&self) -> &[usize] {
        &self.outshape
    }

    fn typ(&self) -> String {
        "Flatten".into()
    }

    fn box_clone(&self) -> Box<dyn LayerTrait<F>> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random(shape: &[usize], seed: u64) -> ArrayD<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0, 1.0), &mut rng)
    }

    #[test]
    fn test_conv_connect_allocates_mirrored_gradients() {
        let mut layer = ConvLayer::<f64>::new(4, 3, 3, Activation::Sigmoid).unwrap();
        assert_eq!(layer.connect(&[1, 8, 8]).unwrap(), vec![4, 6, 6]);
        assert_eq!(layer.weights.dim(), (4, 1, 3, 3));
        assert_eq!(layer.nabla_w.dim(), layer.weights.dim());
        assert_eq!(layer.nabla_b.dim(), layer.biases.dim());
        assert!(layer.trainable());
    }

    #[test]
    fn test_conv_rejects_large_filter() {
        let mut layer = ConvLayer::<f64>::new(2, 5, 3, Activation::Linear).unwrap();
        assert!(matches!(
            layer.connect(&[1, 4, 8]),
            Err(NNError::InvalidLayerConfiguration(_))
        ));
    }

    #[test]
    fn test_conv_rejects_softmax_at_connect() {
        let mut layer = ConvLayer::<f64>::new(2, 2, 2, Activation::softmax()).unwrap();
        assert!(matches!(
            layer.connect(&[1, 4, 4]),
            Err(NNError::InvalidLayerConfiguration(_))
        ));
        let built = Sequential::<f64>::builder(&[1, 4, 4]).add_conv(2, 2, 2, Activation::softmax());
        assert!(matches!(built, Err(NNError::InvalidLayerConfiguration(_))));
    }

    #[test]
    fn test_pool_rejects_non_dividing_window_at_connect() {
        let mut layer = PoolLayer::new(3).unwrap();
        let result = LayerTrait::<f64>::connect(&mut layer, &[2, 8, 8]);
        assert!(matches!(result, Err(NNError::InvalidLayerConfiguration(_))));
    }

    #[test]
    fn test_conv_bias_gradient_sums_error() {
        let mut layer = ConvLayer::<f64>::new(2, 2, 2, Activation::Linear).unwrap();
        layer.connect(&[1, 3, 3]).unwrap();
        layer.feedforward(random(&[3, 1, 3, 3], 1)).unwrap();
        let error = random(&[3, 2, 2, 2], 2);
        layer.backpropagate(error.clone()).unwrap();
        for f in 0..2 {
            let expected = error.index_axis(Axis(1), f).sum();
            assert!((layer.nabla_b[f] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_conv_bias_shifts_output() {
        let mut layer = ConvLayer::<f64>::new(2, 2, 2, Activation::Linear).unwrap();
        layer.connect(&[1, 3, 3]).unwrap();
        let x = random(&[1, 1, 3, 3], 3);
        let before = layer.feedforward(x.clone()).unwrap();
        layer.biases = Array1::from(vec![1.0, -2.0]);
        let after = layer.feedforward(x).unwrap();
        let shift = &after - &before;
        assert!(shift.index_axis(Axis(1), 0).iter().all(|v| (v - 1.0).abs() < 1e-12));
        assert!(shift.index_axis(Axis(1), 1).iter().all(|v| (v + 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_pool_mask_is_consumed() {
        let mut layer = PoolLayer::new(2).unwrap();
        LayerTrait::<f64>::connect(&mut layer, &[1, 4, 4]).unwrap();
        layer.feedforward(random(&[2, 1, 4, 4], 4)).unwrap();
        let error = random(&[2, 1, 2, 2], 5);
        assert_eq!(layer.backpropagate(error.clone()).unwrap().shape(), &[2, 1, 4, 4]);
        assert!(matches!(
            layer.backpropagate(error),
            Err(NNError::ComputationError(_))
        ));
    }

    #[test]
    fn test_backpropagate_before_feedforward() {
        let mut layer = DenseLayer::<f64>::new(3, Activation::Tanh).unwrap();
        layer.connect(&[4]).unwrap();
        assert!(layer.backpropagate(random(&[1, 3], 6)).is_err());
    }

    #[test]
    fn test_wrong_input_shape() {
        let mut layer = ConvLayer::<f64>::new(2, 2, 2, Activation::Relu).unwrap();
        layer.connect(&[1, 5, 5]).unwrap();
        assert!(matches!(
            layer.feedforward(random(&[1, 2, 5, 5], 7)),
            Err(NNError::InvalidInputShape(_))
        ));
    }

    #[test]
    fn test_flatten_round_trip() {
        let mut layer = FlattenLayer::new();
        assert_eq!(LayerTrait::<f64>::connect(&mut layer, &[2, 3, 3]).unwrap(), vec![18]);
        let x = random(&[4, 2, 3, 3], 8);
        let flat = layer.feedforward(x.clone()).unwrap();
        assert_eq!(flat.shape(), &[4, 18]);
        assert_eq!(layer.backpropagate(flat).unwrap(), x);
    }

    #[test]
    fn test_dense_requires_flat_input() {
        let mut layer = DenseLayer::<f64>::new(3, Activation::Sigmoid).unwrap();
        assert!(layer.connect(&[2, 3]).is_err());
        assert_eq!(layer.connect(&[6]).unwrap(), vec![3]);
        assert_eq!(layer.typ(), "Dense(3)-sigm");
    }
}
