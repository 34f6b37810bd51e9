use burn::tensor::backend::Backend;
use burn::tensor::{Data, Element, Int, Numeric, Shape, Tensor};
use num_traits::ToPrimitive;
use rand::Rng;
use rand_distr::StandardNormal;

pub mod upsample;

pub(crate) fn pad_with_zeros<B, const D: usize, K>(
    tensor: Tensor<B, D, K>,
    dim: usize,
    left: usize,
    right: usize,
) -> Tensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
    K::Elem: Element,
{
    assert!(
        dim < D,
        "dim must be less than the number of dimensions of the tensor"
    );
    if left == 0 && right == 0 {
        return tensor;
    }

    let device = tensor.device();
    let mut parts = Vec::with_capacity(3);
    if left > 0 {
        let mut dims = tensor.dims();
        dims[dim] = left;
        parts.push(Tensor::zeros(dims, &device));
    }
    let mut dims = tensor.dims();
    parts.push(tensor);
    if right > 0 {
        dims[dim] = right;
        parts.push(Tensor::zeros(dims, &device));
    }

    Tensor::cat(parts, dim)
}

/// Gathers `values[t]` for every example and shapes them `[batch, 1, 1, 1]`
/// so they broadcast over NCHW samples.
pub(crate) fn per_example<B: Backend>(
    values: &[f64],
    timesteps: &[usize],
    device: &B::Device,
) -> Tensor<B, 4> {
    let gathered: Vec<f32> = timesteps.iter().map(|&t| values[t] as f32).collect();
    let batch_size = gathered.len();

    Tensor::from_floats(Data::new(gathered, Shape::new([batch_size, 1, 1, 1])), device)
}

/// Same as [`per_example`] for values already gathered per example.
pub(crate) fn batch_column<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 4> {
    let column: Vec<f32> = values.iter().map(|value| *value as f32).collect();
    let batch_size = column.len();

    Tensor::from_floats(Data::new(column, Shape::new([batch_size, 1, 1, 1])), device)
}

/// Values already gathered per example as a `[batch]` vector.
pub(crate) fn batch_vector<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let column: Vec<f32> = values.iter().map(|value| *value as f32).collect();
    let batch_size = column.len();

    Tensor::from_floats(Data::new(column, Shape::new([batch_size])), device)
}

/// Timesteps as the integer tensor handed to a backbone.
pub(crate) fn timestep_tensor<B: Backend>(timesteps: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let ints: Vec<i32> = timesteps.iter().map(|&t| t as i32).collect();
    let batch_size = ints.len();

    Tensor::from_ints(Data::new(ints, Shape::new([batch_size])), device)
}

/// Draws a standard normal tensor from `rng`, independent of the backend's
/// own random state.
pub(crate) fn standard_normal<B: Backend, const D: usize, R: Rng + ?Sized>(
    shape: [usize; D],
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let num_elements = shape.iter().product::<usize>();
    let values: Vec<f32> = (0..num_elements)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();

    Tensor::from_floats(Data::new(values, Shape::new(shape)), device)
}

/// Mean over every dimension except the batch dimension.
pub(crate) fn mean_flat<B: Backend>(tensor: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch_size, _, _, _] = tensor.dims();
    tensor.flatten::<2>(1, 3).mean_dim(1).reshape([batch_size])
}

/// Copies a tensor to the host as `f64` values. Unrepresentable values become NaN.
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f64> {
    tensor
        .into_data()
        .value
        .into_iter()
        .map(|value| value.to_f64().unwrap_or(f64::NAN))
        .collect()
}

/// Reads a single element tensor as `f64`.
pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().to_f64().unwrap_or(f64::NAN)
}
