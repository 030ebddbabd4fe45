//! Forward and backward kernels over batched `(batch, channel, height, width)` tensors.
//!
//! Convolution is a stride-1 cross-correlation. The convolution layer reuses the
//! one primitive three ways: the forward pass, the weight gradient (with batch
//! and channel axes swapped) and the input error (with a flipped kernel in
//! `Full` mode).

#[allow(unused)]
use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConvMode {
    /// No padding, output shrinks to `(H - Fh + 1, W - Fw + 1)`.
    Valid,
    /// Zero padding of `F - 1` on every side, output grows to `(H + Fh - 1, W + Fw - 1)`.
    Full,
}

/// Argmax record of one max-pooling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMask {
    window: usize,
    /// Flat in-block offset `row * window + col` of the selected element.
    offsets: Array4<usize>,
}

impl PoolMask {
    pub fn window(&self) -> usize {
        self.window
    }

    /// Shape of the pooled output this mask belongs to.
    pub fn output_dim(&self) -> (usize, usize, usize, usize) {
        self.offsets.dim()
    }

    pub fn offsets(&self) -> ArrayView4<'_, usize> {
        self.offsets.view()
    }

    /// Input `(row, col)` that produced output cell `(i, j)` of sample `n`, channel `c`.
    pub fn position(&self, n: usize, c: usize, i: usize, j: usize) -> (usize, usize) {
        let offset = self.offsets[[n, c, i, j]];
        (
            i * self.window + offset / self.window,
            j * self.window + offset % self.window,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaxPoolOp;

impl MaxPoolOp {
    pub fn apply<F: Scalar>(
        &self,
        input: ArrayView4<F>,
        window: usize,
    ) -> Result<(Array4<F>, PoolMask)> {
        let (n, c, iy, ix) = input.dim();
        if window == 0 || iy % window != 0 || ix % window != 0 {
            return Err(NNError::InvalidInputShape(format!(
                "pool window {} does not divide input plane {}x{}",
                window, iy, ix
            )));
        }

        let shape = (n, c, iy / window, ix / window);
        let mut output = Array4::<F>::zeros(shape);
        let mut offsets = Array4::<usize>::zeros(shape);
        Zip::indexed(&mut output)
            .and(&mut offsets)
            .for_each(|(b, ch, i, j), out, offset| {
                let block = input.slice(s![
                    b,
                    ch,
                    i * window..(i + 1) * window,
                    j * window..(j + 1) * window
                ]);
                let (mut best, mut arg) = (F::neg_infinity(), 0);
                for (k, &v) in block.iter().enumerate() {
                    if k == 0 || v > best {
                        best = v;
                        arg = k;
                    }
                }
                *out = best;
                *offset = arg;
            });

        Ok((output, PoolMask { window, offsets }))
    }

    /// Routes every output error to the input element recorded in `mask`.
    pub fn backward<F: Scalar>(&self, error: ArrayView4<F>, mask: &PoolMask) -> Result<Array4<F>> {
        if error.dim() != mask.output_dim() {
            return Err(NNError::LayerShapeMismatch(format!(
                "pool error {:?} does not match mask {:?}",
                error.dim(),
                mask.output_dim()
            )));
        }
        let w = mask.window;
        let (n, c, oy, ox) = error.dim();
        let mut prev = Array4::<F>::zeros((n, c, oy * w, ox * w));
        Zip::indexed(error)
            .and(&mask.offsets)
            .for_each(|(b, ch, i, j), &e, &offset| {
                prev[[b, ch, i * w + offset / w, j * w + offset % w]] = e;
            });
        Ok(prev)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvolutionOp;

impl ConvolutionOp {
    /// Cross-correlates `input (n, c, h, w)` with `kernel (f, c, fh, fw)`, giving `(n, f, oh, ow)`.
    pub fn apply<F: Scalar>(
        &self,
        input: ArrayView4<F>,
        kernel: ArrayView4<F>,
        mode: ConvMode,
    ) -> Result<Array4<F>> {
        let (n, ic, iy, ix) = input.dim();
        let (_, fc, fy, fx) = kernel.dim();
        if ic != fc {
            return Err(NNError::LayerShapeMismatch(format!(
                "input has {} channels but kernel expects {}",
                ic, fc
            )));
        }
        if fy == 0 || fx == 0 {
            return Err(NNError::InvalidWeightShape(format!(
                "empty filter {}x{}",
                fy, fx
            )));
        }

        match mode {
            ConvMode::Valid => {
                if iy < fy || ix < fx {
                    return Err(NNError::InvalidInputShape(format!(
                        "filter {}x{} larger than input {}x{}",
                        fy, fx, iy, ix
                    )));
                }
                correlate(input, kernel)
            }
            ConvMode::Full => {
                let (py, px) = (fy - 1, fx - 1);
                let mut padded = Array4::<F>::zeros((n, ic, iy + 2 * py, ix + 2 * px));
                padded
                    .slice_mut(s![.., .., py..py + iy, px..px + ix])
                    .assign(&input);
                correlate(padded.view(), kernel)
            }
        }
    }

    /// `dC/dW` for a valid-mode forward pass: the batch axis becomes the
    /// channel-summation axis of the correlation.
    pub fn weight_gradient<F: Scalar>(
        &self,
        inputs: ArrayView4<F>,
        delta: ArrayView4<F>,
    ) -> Result<Array4<F>> {
        let grad = self.apply(
            inputs.permuted_axes([1, 0, 2, 3]),
            delta.permuted_axes([1, 0, 2, 3]),
            ConvMode::Valid,
        )?;
        Ok(grad
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned())
    }

    /// `dC/dX`: full-mode correlation of the error with the spatially flipped,
    /// filter/channel-swapped weights.
    pub fn input_error<F: Scalar>(
        &self,
        delta: ArrayView4<F>,
        weights: ArrayView4<F>,
    ) -> Result<Array4<F>> {
        let flipped = weights
            .slice_move(s![.., .., ..;-1, ..;-1])
            .permuted_axes([1, 0, 2, 3]);
        self.apply(delta, flipped, ConvMode::Full)
    }
}

// im2col followed by one matrix product
fn correlate<F: Scalar>(input: ArrayView4<F>, kernel: ArrayView4<F>) -> Result<Array4<F>> {
    let (n, ic, iy, ix) = input.dim();
    let (nf, _, fy, fx) = kernel.dim();
    let (oy, ox) = (iy - fy + 1, ix - fx + 1);
    let patch = ic * fy * fx;

    let mut columns = Array2::<F>::zeros((n * oy * ox, patch));
    for (b, sample) in input.outer_iter().enumerate() {
        for (k, window) in sample.windows((ic, fy, fx)).into_iter().enumerate() {
            let mut row = columns.row_mut(b * oy * ox + k);
            for (dst, &src) in row.iter_mut().zip(window.iter()) {
                *dst = src;
            }
        }
    }

    let filters = kernel.to_shape((nf, patch))?;
    let product = columns.dot(&filters.t());
    let output = product
        .into_shape_with_order((n, oy, ox, nf))?
        .permuted_axes([0, 3, 1, 2]);
    Ok(output.as_standard_layout().into_owned())
}
