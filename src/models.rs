use crate::core::layers::{ConvLayer, DenseLayer, FlattenLayer, LayerTrait, PoolLayer};
use crate::prelude::*;
use tracing::debug;

/// Parameter shapes of one layer, as seen by the gradient check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParamShape {
    pub layer: String,
    pub trainable: bool,
    pub weights: Vec<usize>,
    pub biases: Vec<usize>,
}

impl ParamShape {
    pub fn size(&self) -> usize {
        if !self.trainable {
            return 0;
        }
        self.weights.iter().product::<usize>() + self.biases.iter().product::<usize>()
    }
}

/// What the gradient check needs from a network.
///
/// `get_weights` unfolds every trainable layer's weights followed by its
/// biases into one vector, in layer order, skipping non-trainable layers.
/// `set_weights` folds such a vector back and `get_gradients` unfolds the
/// gradients of the last `backpropagate` in the same order.
pub trait Network<F: Scalar> {
    fn predict(&mut self, x: &ArrayD<F>) -> Result<ArrayD<F>>;

    fn cost(&self, prediction: &ArrayD<F>, target: &ArrayD<F>) -> Result<F>;

    fn cost_derivative(&self, prediction: &ArrayD<F>, target: &ArrayD<F>) -> Result<ArrayD<F>>;

    fn backpropagate(&mut self, error: ArrayD<F>) -> Result<()>;

    fn get_weights(&self) -> Array1<F>;

    fn set_weights(&mut self, ws: ArrayView1<F>) -> Result<()>;

    fn get_gradients(&self) -> Array1<F>;

    fn param_shapes(&self) -> Vec<ParamShape>;
}

#[derive(Clone)]
pub struct Sequential<F: Scalar> {
    pub layers: Vec<Box<dyn LayerTrait<F>>>,
    pub input_shape: Vec<usize>,
    pub loss: Loss,
}

pub struct SequentialBuilder<F: Scalar> {
    layers: Vec<Box<dyn LayerTrait<F>>>,
    input_shape: Vec<usize>,
    outshape: Vec<usize>,
    loss: Option<Loss>,
}

impl<F: Scalar> SequentialBuilder<F> {
    /// Connects `layer` to the current output shape right away, so shape
    /// incompatibilities surface here and never during a forward pass.
    pub fn add<L: LayerTrait<F> + 'static>(mut self, mut layer: L) -> Result<Self> {
        self.outshape = layer.connect(&self.outshape)?;
        debug!("added {} -> {:?}", layer.typ(), self.outshape);
        self.layers.push(Box::new(layer));
        Ok(self)
    }

    pub fn add_conv(self, nfilters: usize, filtery: usize, filterx: usize, activation: Activation) -> Result<Self> {
        self.add(ConvLayer::<F>::new(nfilters, filtery, filterx, activation)?)
    }

    pub fn add_pool(self, fdim: usize) -> Result<Self> {
        self.add(PoolLayer::new(fdim)?)
    }

    pub fn add_flatten(self) -> Result<Self> {
        self.add(FlattenLayer::new())
    }

    pub fn add_dense(self, neurons: usize, activation: Activation) -> Result<Self> {
        self.add(DenseLayer::<F>::new(neurons, activation)?)
    }

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn build(self) -> Result<Sequential<F>> {
        if self.layers.is_empty() {
            return Err(NNError::EmptyModel);
        }
        let loss = self
            .loss
            .ok_or_else(|| NNError::InvalidLoss("Loss function not set".to_string()))?;
        Ok(Sequential {
            layers: self.layers,
            input_shape: self.input_shape,
            loss,
        })
    }
}

impl<F: Scalar> Sequential<F> {
    pub fn builder(input_shape: &[usize]) -> SequentialBuilder<F> {
        SequentialBuilder {
            layers: Vec::new(),
            input_shape: input_shape.to_vec(),
            outshape: input_shape.to_vec(),
            loss: None,
        }
    }

    pub fn outshape(&self) -> &[usize] {
        self.layers
            .last()
            .map(|layer| layer.outshape())
            .unwrap_or(&self.input_shape)
    }

    pub fn count_parameters(&self) -> usize {
        self.trainable_layers()
            .filter_map(|layer| layer.params())
            .map(|p| p.weights.len() + p.biases.len())
            .sum()
    }

    pub fn summary(&self) -> String {
        let mut res = "\nModel Sequential\n".to_string();
        res.push_str("-------------------------------------------------------------\n");
        res.push_str("Layer (Type)\t\t Output shape\t\t No.of params\n");
        for layer in self.layers.iter() {
            let params = layer
                .params()
                .filter(|_| layer.trainable())
                .map(|p| p.weights.len() + p.biases.len())
                .unwrap_or(0);
            res.push_str(&format!(
                "{}\t\t  (None, {:?})\t\t  {}\n",
                layer.typ(),
                layer.outshape(),
                params
            ));
        }
        res.push_str("-------------------------------------------------------------\n");
        res.push_str(&format!("Total params: {}\n", self.count_parameters()));
        res
    }

    fn trainable_layers(&self) -> impl Iterator<Item = &Box<dyn LayerTrait<F>>> + '_ {
        self.layers.iter().filter(|layer| layer.trainable())
    }

    /// Per-layer `(weights, biases)` of the trainable layers, without unfolding.
    pub fn layer_weights(&self) -> Vec<(ArrayD<F>, ArrayD<F>)> {
        self.trainable_layers()
            .filter_map(|layer| layer.params())
            .map(|p| (p.weights.to_owned(), p.biases.to_owned()))
            .collect()
    }

    pub fn evaluate(&mut self, x: &ArrayD<F>, y: &ArrayD<F>) -> Result<F> {
        let prediction = self.predict(x)?;
        self.cost(&prediction, y)
    }
}

impl<F: Scalar> Network<F> for Sequential<F> {
    fn predict(&mut self, x: &ArrayD<F>) -> Result<ArrayD<F>> {
        if x.ndim() != self.input_shape.len() + 1 || x.shape()[1..] != self.input_shape[..] {
            return Err(NNError::InvalidInputShape(format!(
                "network expects (batch, {:?}), got {:?}",
                self.input_shape,
                x.shape()
            )));
        }
        let mut a = x.clone();
        for layer in self.layers.iter_mut() {
            a = layer.feedforward(a)?;
        }
        Ok(a)
    }

    fn cost(&self, prediction: &ArrayD<F>, target: &ArrayD<F>) -> Result<F> {
        self.loss.cost(prediction, target)
    }

    fn cost_derivative(&self, prediction: &ArrayD<F>, target: &ArrayD<F>) -> Result<ArrayD<F>> {
        self.loss.derivative(prediction, target)
    }

    fn backpropagate(&mut self, mut error: ArrayD<F>) -> Result<()> {
        for layer in self.layers.iter_mut().rev() {
            error = layer.backpropagate(error)?;
        }
        Ok(())
    }

    fn get_weights(&self) -> Array1<F> {
        let mut ws = Vec::with_capacity(self.count_parameters());
        for p in self.trainable_layers().filter_map(|layer| layer.params()) {
            ws.extend(p.weights.iter().copied());
            ws.extend(p.biases.iter().copied());
        }
        Array1::from(ws)
    }

    fn set_weights(&mut self, ws: ArrayView1<F>) -> Result<()> {
        let expected = self.count_parameters();
        if ws.len() != expected {
            return Err(NNError::InvalidWeightShape(format!(
                "got {} parameters, network has {}",
                ws.len(),
                expected
            )));
        }
        let mut values = ws.iter();
        for mut p in self
            .layers
            .iter_mut()
            .filter(|layer| layer.trainable())
            .filter_map(|layer| layer.params_mut())
        {
            for (dst, src) in p.weights.iter_mut().chain(p.biases.iter_mut()).zip(&mut values) {
                *dst = *src;
            }
        }
        Ok(())
    }

    fn get_gradients(&self) -> Array1<F> {
        let mut grads = Vec::with_capacity(self.count_parameters());
        for g in self.trainable_layers().filter_map(|layer| layer.gradients()) {
            grads.extend(g.weights.iter().copied());
            grads.extend(g.biases.iter().copied());
        }
        Array1::from(grads)
    }

    fn param_shapes(&self) -> Vec<ParamShape> {
        self.layers
            .iter()
            .map(|layer| match layer.params().filter(|_| layer.trainable()) {
                Some(p) => ParamShape {
                    layer: layer.typ(),
                    trainable: true,
                    weights: p.weights.shape().to_vec(),
                    biases: p.biases.shape().to_vec(),
                },
                None => ParamShape {
                    layer: layer.typ(),
                    trainable: false,
                    weights: Vec::new(),
                    biases: Vec::new(),
                },
            })
            .collect()
    }
}
