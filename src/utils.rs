#[allow(unused)]
use crate::prelude::*;
use rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;

/// Standard deviation of the white noise used to initialize a parameter
/// tensor: `(fanin, fanout)` for dense weights, `(nf, fc, fy, fx)` for
/// convolution filters.
pub fn white_scale(dims: &[usize]) -> Result<f64> {
    match *dims {
        [fanin, fanout] => Ok((2.0 / (fanin + fanout) as f64).sqrt()),
        [nf, fc, fy, fx] => Ok((2.0 / (nf * fy * fx + fc * fy * fx) as f64).sqrt()),
        _ => Err(NNError::InvalidWeightShape(format!(
            "white noise is defined for rank 2 or 4 tensors, got {:?}",
            dims
        ))),
    }
}

pub fn white_using<F: Scalar, R: Rng + ?Sized>(dims: &[usize], rng: &mut R) -> Result<ArrayD<F>> {
    let scale = white_scale(dims)?;
    let noise = ArrayD::<f64>::random_using(IxDyn(dims), StandardNormal, rng);
    Ok(noise.mapv(|v| F::scal(v * scale)))
}

pub fn white<F: Scalar>(dims: &[usize]) -> Result<ArrayD<F>> {
    white_using(dims, &mut rand::thread_rng())
}

/// Reshapes a tensor to a matrix, keeping the first axis as rows.
pub fn rtm<F: Scalar>(a: &ArrayD<F>) -> Result<Array2<F>> {
    let rows = a.shape().first().copied().unwrap_or(1);
    let cols = a.shape().iter().skip(1).product::<usize>();
    Ok(a.to_shape((rows, cols))?.into_owned())
}

#[macro_export]
macro_rules! white_array {
    ($($x:expr),*) => {
        {
            $crate::utils::white(&[$($x),*])
        }
    };
}
