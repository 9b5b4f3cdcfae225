//! Utilities.
use anyhow::{anyhow, Result};
use candle_core::{backprop::GradStore, Device, Tensor, WithDType};
use candle_nn::VarMap;
use mirage_core::record::{Record, RecordValue};
use ndarray::{Array, ArrayD, Dimension, IxDyn};

/// Returns the standard deviation of a tensor.
pub fn std(t: &Tensor) -> Result<f32> {
    Ok(t.broadcast_sub(&t.mean_all()?)?
        .powf(2f64)?
        .mean_all()?
        .sqrt()?
        .to_vec0::<f32>()?)
}

/// Returns the mean and standard deviation of the parameters.
///
/// Keys are `{prefix}.{var}_mean` and `{prefix}.{var}_std`.
pub fn param_stats(varmap: &VarMap, prefix: &str) -> Result<Record> {
    let mut record = Record::empty();
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow!("varmap lock poisoned: {}", e))?;

    for (k, v) in data.iter() {
        let m: f32 = v.mean_all()?.to_vec0()?;
        record.insert(format!("{}.{}_mean", prefix, k), RecordValue::Scalar(m));
        let s = std(v.as_tensor())?;
        record.insert(format!("{}.{}_std", prefix, k), RecordValue::Scalar(s));
    }

    Ok(record)
}

/// Rescales gradients in place so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(varmap: &VarMap, grads: &mut GradStore, max_norm: f64) -> Result<f32> {
    let vars = varmap.all_vars();
    let mut sq_sum = 0f32;
    for var in vars.iter() {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq_sum += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = sq_sum.sqrt();

    if norm.is_finite() && (norm as f64) > max_norm {
        let scale = max_norm / (norm as f64 + 1e-6);
        for var in vars.iter() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let g = (g * scale)?;
                grads.insert(var.as_tensor(), g);
            }
        }
    }

    Ok(norm)
}

/// Converts an array of any dimension into a tensor with the same shape.
pub fn array_to_tensor<T, D>(a: &Array<T, D>, device: &Device) -> Result<Tensor>
where
    T: WithDType,
    D: Dimension,
{
    let shape = a.shape().to_vec();
    let v = a.iter().copied().collect::<Vec<_>>();
    Ok(Tensor::from_vec(v, shape, device)?)
}

/// Converts a tensor into an array with dynamic dimension.
pub fn tensor_to_arrayd<T: WithDType>(t: &Tensor) -> Result<ArrayD<T>> {
    let shape = t.dims().to_vec();
    let v: Vec<T> = t.flatten_all()?.to_vec1()?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), v)?)
}

/// Converts a 2-dimensional tensor into an array.
pub fn tensor_to_array2<T: WithDType>(t: &Tensor) -> Result<ndarray::Array2<T>> {
    Ok(tensor_to_arrayd(t)?.into_dimensionality()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Var};
    use candle_nn::Init;
    use ndarray::arr2;

    #[test]
    fn test_array_tensor_conversion() -> Result<()> {
        let a = arr2(&[[1f32, 2., 3.], [4., 5., 6.]]);
        let t = array_to_tensor(&a, &Device::Cpu)?;
        assert_eq!(t.dims(), &[2, 3]);
        let a_ = tensor_to_array2::<f32>(&t)?;
        assert_eq!(a, a_);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let varmap = VarMap::new();
        let w = varmap.get((2,), "w", Init::Const(1.0), DType::F32, &Device::Cpu)?;
        // loss = 3 * w0 + 4 * w1, so the gradient is (3, 4) with norm 5
        let c = Tensor::from_slice(&[3f32, 4.], (2,), &Device::Cpu)?;
        let loss = (w * c)?.sum_all()?;
        let mut grads = loss.backward()?;

        let norm = clip_grad_norm(&varmap, &mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);

        let var: Var = varmap.all_vars().remove(0);
        let g: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1()?;
        assert!((g[0] - 0.6).abs() < 1e-4);
        assert!((g[1] - 0.8).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_param_stats_keys() -> Result<()> {
        let varmap = VarMap::new();
        varmap.get((3,), "fc1.bias", Init::Const(2.0), DType::F32, &Device::Cpu)?;
        let record = param_stats(&varmap, "state_model")?;
        assert_eq!(record.get_scalar("state_model.fc1.bias_mean")?, 2.0);
        assert_eq!(record.get_scalar("state_model.fc1.bias_std")?, 0.0);
        Ok(())
    }
}
