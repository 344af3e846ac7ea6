//! Tensors which form a computation graph
//!
//! A [`Tensor`] is a shared handle to a node in the graph. Operations on tensors create new
//! derived nodes that keep their inputs alive as children, so calling [`Tensor::backward`] on
//! the final (scalar) node propagates gradients back to every leaf which requires them.
use std::{
    cell::{Ref, RefCell},
    cmp::Ordering,
    collections::HashSet,
    fmt::{self, Debug, Display},
    rc::Rc,
};

use rand::Rng;
use thiserror::Error;

use crate::backprop_fns::{BackpropFunc, update_gradients};

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Errors for tensor construction and operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Data of length {len} does not fit shape {shape:?}")]
    DataShapeMismatch { len: usize, shape: Vec<usize> },
    #[error("Expected a tensor of rank {expected}, got shape {shape:?}")]
    RankMismatch { expected: usize, shape: Vec<usize> },
    #[error("Incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("Cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<usize> },
    #[error("Window {kernel}x{kernel} with stride {stride} does not fit input shape {shape:?}")]
    InvalidWindow {
        kernel: usize,
        stride: usize,
        shape: Vec<usize>,
    },
    #[error("Target {target} out of range for {classes} classes")]
    TargetOutOfRange { target: usize, classes: usize },
    #[error("Got {targets} targets for a batch of {batch}")]
    TargetCountMismatch { targets: usize, batch: usize },
    #[error("Expected a single-element tensor, got shape {shape:?}")]
    NotScalar { shape: Vec<usize> },
    #[error("Shape {shape:?} has an empty feature dimension")]
    EmptyDim { shape: Vec<usize> },
}

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a new leaf tensor which does not track gradients (e.g. input data)
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, TensorError> {
        check_len(&data, &shape)?;
        Ok(Self::from_inner(InnerTensor::new(data, shape, false, None)))
    }

    /// Create a new leaf tensor whose gradient is accumulated by `backward` (e.g. weights)
    pub fn parameter(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, TensorError> {
        check_len(&data, &shape)?;
        Ok(Self::from_inner(InnerTensor::new(data, shape, true, None)))
    }

    /// Create a parameter whose elements are drawn from `f`, e.g. a weight initializer
    pub fn parameter_with(shape: Vec<usize>, f: impl FnMut() -> f32) -> Self {
        let n = shape.iter().product();
        let data = std::iter::repeat_with(f).take(n).collect();
        Self::from_inner(InnerTensor::new(data, shape, true, None))
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![0.0; shape.iter().product()];
        Self::from_inner(InnerTensor::new(data, shape, false, None))
    }

    /// A zero-dimensional tensor holding a single value
    pub fn scalar(data: f32) -> Self {
        Self::from_inner(InnerTensor::new(vec![data], vec![], false, None))
    }

    fn from_inner(inner: InnerTensor) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Create a new tensor derived from an operation on other tensors (i.e. not a leaf node).
    /// It requires gradients iff one of its children does.
    fn new_derived(
        data: Vec<f32>,
        shape: Vec<usize>,
        backprop_fn: BackpropFunc,
        children: &[&Tensor],
    ) -> Self {
        debug_assert_eq!(backprop_fn.n_operands(), children.len());
        let requires_grad = children.iter().any(|c| c.requires_grad());
        let mut inner = InnerTensor::new(data, shape, requires_grad, Some(backprop_fn));
        inner.children = children.iter().map(|c| c.0.clone()).collect();
        Self::from_inner(inner)
    }

    pub fn data(&self) -> Ref<'_, [f32]> {
        Ref::map(self.0.borrow(), |inner| inner.data.as_slice())
    }

    /// Gradient of the graph output with respect to this tensor.
    /// Empty for tensors which do not require gradients.
    pub fn grad(&self) -> Ref<'_, [f32]> {
        Ref::map(self.0.borrow(), |inner| inner.grad.as_slice())
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Returns the value of a single-element tensor
    pub fn item(&self) -> Result<f32, TensorError> {
        let inner = self.0.borrow();
        match inner.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::NotScalar {
                shape: inner.shape.clone(),
            }),
        }
    }

    // Strictly, &mut isn't needed since the tensor is behind a shared mutable type,
    // but it indicates that the tensor should be exclusively mutable
    pub fn set_data(&mut self, data: Vec<f32>) -> Result<(), TensorError> {
        let mut inner = self.0.borrow_mut();
        check_len(&data, &inner.shape)?;
        inner.data = data;
        Ok(())
    }

    /// Zeros the gradient of this tensor only. Intermediate tensors are dropped together with the
    /// graph output, so only leaves (parameters) need zeroing between steps
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad.fill(0.0);
    }

    /// Back-propagates from a single-element tensor through every node which requires gradients
    pub fn backward(&self) -> Result<(), TensorError> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.data.len() != 1 {
                return Err(TensorError::NotScalar {
                    shape: inner.shape.clone(),
                });
            }
            if !inner.requires_grad {
                return Ok(());
            }
            // d out / d out = 1
            inner.grad[0] = 1.0;
        }

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();

        // visit in post order
        self.backward_inner(&mut backprop_order, &mut visited);

        // apply backprop, reversed to start from root first
        for tensor in backprop_order.into_iter().rev() {
            update_gradients(&tensor);
        }
        Ok(())
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            let (id, requires_grad) = {
                let child = c.borrow();
                (child.id, child.requires_grad)
            };
            if !requires_grad || visited.contains(&id) {
                continue;
            }
            visited.insert(id);
            Tensor(c.clone()).backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }

    /// `[rows, features]` with at least one feature per row
    fn dims2(&self) -> Result<(usize, usize), TensorError> {
        match self.shape().as_slice() {
            &[_, 0] => Err(TensorError::EmptyDim {
                shape: self.shape(),
            }),
            &[a, b] => Ok((a, b)),
            shape => Err(TensorError::RankMismatch {
                expected: 2,
                shape: shape.to_vec(),
            }),
        }
    }

    pub(crate) fn dims4(&self) -> Result<(usize, usize, usize, usize), TensorError> {
        match self.shape().as_slice() {
            &[a, b, c, d] => Ok((a, b, c, d)),
            shape => Err(TensorError::RankMismatch {
                expected: 4,
                shape: shape.to_vec(),
            }),
        }
    }
}

// Various operations on tensors
impl Tensor {
    /// Views the same data with a different shape, the number of elements must be kept
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor, TensorError> {
        let from = self.shape();
        if from.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(TensorError::InvalidReshape { from, to: shape });
        }
        let data = self.data().to_vec();
        Ok(Tensor::new_derived(
            data,
            shape,
            BackpropFunc::Reshape,
            &[self],
        ))
    }

    pub fn relu(&self) -> Tensor {
        let data = self.data().iter().map(|v| v.max(0.0)).collect();
        Tensor::new_derived(data, self.shape(), BackpropFunc::ReLU, &[self])
    }

    /// `x @ weight^T + bias` for `x: [N, I]`, `weight: [O, I]` and `bias: [O]`
    pub fn linear(&self, weight: &Tensor, bias: &Tensor) -> Result<Tensor, TensorError> {
        let (n, n_in) = self.dims2()?;
        let (n_out, w_in) = weight.dims2()?;
        if n_out == 0 {
            return Err(TensorError::EmptyDim {
                shape: weight.shape(),
            });
        }
        if w_in != n_in {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape(),
                rhs: weight.shape(),
            });
        }
        if bias.shape() != [n_out] {
            return Err(TensorError::ShapeMismatch {
                lhs: weight.shape(),
                rhs: bias.shape(),
            });
        }

        let data = {
            let x = self.data();
            let w = weight.data();
            let b = bias.data();
            let mut out = vec![0.0; n * n_out];
            for (row, x_row) in x.chunks_exact(n_in).enumerate() {
                for (col, w_row) in w.chunks_exact(n_in).enumerate() {
                    let dot = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum::<f32>();
                    out[row * n_out + col] = dot + b[col];
                }
            }
            out
        };
        Ok(Tensor::new_derived(
            data,
            vec![n, n_out],
            BackpropFunc::Linear,
            &[self, weight, bias],
        ))
    }

    /// 2D cross-correlation without padding for `x: [N, C, H, W]`, `weight: [O, C, KH, KW]`
    /// and `bias: [O]`
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: &Tensor,
        stride: usize,
    ) -> Result<Tensor, TensorError> {
        let (n, c, h, w) = self.dims4()?;
        let (n_out, w_c, kh, kw) = weight.dims4()?;
        if w_c != c {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape(),
                rhs: weight.shape(),
            });
        }
        if bias.shape() != [n_out] {
            return Err(TensorError::ShapeMismatch {
                lhs: weight.shape(),
                rhs: bias.shape(),
            });
        }
        if stride == 0 || kh == 0 || kw == 0 || kh > h || kw > w {
            return Err(TensorError::InvalidWindow {
                kernel: kh.max(kw),
                stride,
                shape: self.shape(),
            });
        }
        let oh = (h - kh) / stride + 1;
        let ow = (w - kw) / stride + 1;

        let data = {
            let x = self.data();
            let k = weight.data();
            let b = bias.data();
            let mut out = vec![0.0; n * n_out * oh * ow];
            for batch in 0..n {
                for oc in 0..n_out {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let mut acc = b[oc];
                            for ic in 0..c {
                                for ky in 0..kh {
                                    let x_row = ((batch * c + ic) * h + oy * stride + ky) * w
                                        + ox * stride;
                                    let k_row = ((oc * c + ic) * kh + ky) * kw;
                                    acc += x[x_row..x_row + kw]
                                        .iter()
                                        .zip(&k[k_row..k_row + kw])
                                        .map(|(a, b)| a * b)
                                        .sum::<f32>();
                                }
                            }
                            out[((batch * n_out + oc) * oh + oy) * ow + ox] = acc;
                        }
                    }
                }
            }
            out
        };
        Ok(Tensor::new_derived(
            data,
            vec![n, n_out, oh, ow],
            BackpropFunc::Conv2d { stride },
            &[self, weight, bias],
        ))
    }

    /// Max over `kernel x kernel` windows of a `[N, C, H, W]` tensor
    pub fn max_pool2d(&self, kernel: usize, stride: usize) -> Result<Tensor, TensorError> {
        let (n, c, h, w) = self.dims4()?;
        if kernel == 0 || stride == 0 || kernel > h || kernel > w {
            return Err(TensorError::InvalidWindow {
                kernel,
                stride,
                shape: self.shape(),
            });
        }
        let oh = (h - kernel) / stride + 1;
        let ow = (w - kernel) / stride + 1;

        let mut data = Vec::with_capacity(n * c * oh * ow);
        // flat input index of the maximum of each window, ties go to the first element
        let mut argmax = Vec::with_capacity(n * c * oh * ow);
        {
            let x = self.data();
            for plane in 0..n * c {
                let base = plane * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = base + oy * stride * w + ox * stride;
                        for ky in 0..kernel {
                            for kx in 0..kernel {
                                let idx = base + (oy * stride + ky) * w + ox * stride + kx;
                                if x[idx] > x[best] {
                                    best = idx;
                                }
                            }
                        }
                        data.push(x[best]);
                        argmax.push(best);
                    }
                }
            }
        }
        Ok(Tensor::new_derived(
            data,
            vec![n, c, oh, ow],
            BackpropFunc::MaxPool2d { argmax },
            &[self],
        ))
    }

    /// Log of the softmax over the second dimension of a `[N, C]` tensor
    pub fn log_softmax(&self) -> Result<Tensor, TensorError> {
        let (_, classes) = self.dims2()?;
        let data = {
            let x = self.data();
            let mut out = Vec::with_capacity(x.len());
            for row in x.chunks_exact(classes) {
                // subtract the max so large logits do not overflow `exp`
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let log_sum_exp = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                out.extend(row.iter().map(|v| v - log_sum_exp));
            }
            out
        };
        Ok(Tensor::new_derived(
            data,
            self.shape(),
            BackpropFunc::LogSoftmax,
            &[self],
        ))
    }

    /// Mean negative log likelihood of `targets` for `[N, C]` log probabilities
    pub fn nll_loss(&self, targets: &[usize]) -> Result<Tensor, TensorError> {
        let (batch, classes) = self.dims2()?;
        if targets.len() != batch {
            return Err(TensorError::TargetCountMismatch {
                targets: targets.len(),
                batch,
            });
        }
        if let Some(&target) = targets.iter().find(|&&t| t >= classes) {
            return Err(TensorError::TargetOutOfRange { target, classes });
        }
        let loss = {
            let x = self.data();
            let total = targets
                .iter()
                .enumerate()
                .map(|(row, &t)| x[row * classes + t])
                .sum::<f32>();
            -total / batch as f32
        };
        Ok(Tensor::new_derived(
            vec![loss],
            vec![],
            BackpropFunc::NllLoss {
                targets: targets.to_vec(),
            },
            &[self],
        ))
    }

    /// Index of the largest value of each row of a `[N, C]` tensor
    pub fn argmax_rows(&self) -> Result<Vec<usize>, TensorError> {
        let (_, classes) = self.dims2()?;
        let x = self.data();
        Ok(x.chunks_exact(classes)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                    .map(|(i, _)| i)
                    .unwrap_or_default()
            })
            .collect())
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let inner = self.0.borrow();
        write!(f, "Tensor(shape={:?}, data=[", inner.shape)?;
        for (i, v) in inner.data.iter().take(PREVIEW).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        if inner.data.len() > PREVIEW {
            write!(f, ", ...")?;
        }
        write!(f, "]")?;
        if let Some(backprop_fn) = &inner.backprop_fn {
            write!(f, ", backprop_fn={}", backprop_fn.name())?;
        }
        write!(f, ")")
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        let lhs = self.0.borrow();
        let rhs = other.0.borrow();
        lhs.shape == rhs.shape && lhs.data == rhs.data
    }
}

pub(crate) struct InnerTensor {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: Vec<f32>,
    /// gradient of the graph output with respect to each element, empty when not tracked
    pub(crate) grad: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    pub(crate) children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerTensor {
    fn new(
        data: Vec<f32>,
        shape: Vec<usize>,
        requires_grad: bool,
        backprop_fn: Option<BackpropFunc>,
    ) -> Self {
        let grad = if requires_grad {
            vec![0.0; data.len()]
        } else {
            vec![]
        };
        Self {
            data,
            grad,
            shape,
            requires_grad,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

// the data buffers can be large, so only the metadata is printed
impl Debug for InnerTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerTensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("n_children", &self.children.len())
            .field("id", &self.id)
            .field("backprop_fn", &self.backprop_fn.as_ref().map(|b| b.name()))
            .finish()
    }
}

fn check_len(data: &[f32], shape: &[usize]) -> Result<(), TensorError> {
    if data.len() != shape.iter().product::<usize>() {
        return Err(TensorError::DataShapeMismatch {
            len: data.len(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-6, "{} != {}", $a, $b);
        };
        ($a:expr, $b:expr, $tol:expr) => {
            assert!((($a) - ($b)).abs() < $tol, "{} != {}", $a, $b);
        };
    }

    fn arange(n: usize) -> Vec<f32> {
        (0..n).map(|v| v as f32).collect()
    }

    #[test]
    fn test_new_checks_shape() {
        let err = Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataShapeMismatch {
                len: 3,
                shape: vec![2, 2]
            }
        );
        let t = Tensor::new(vec![1.0; 6], vec![2, 3]).unwrap();
        assert_eq!(t.numel(), 6);
        assert!(!t.requires_grad());
        assert!(t.grad().is_empty());
    }

    #[test]
    fn test_requires_grad_propagates() {
        let x = Tensor::new(vec![1.0, -1.0], vec![2]).unwrap();
        assert!(!x.relu().requires_grad());
        let p = Tensor::parameter(vec![1.0, -1.0], vec![2]).unwrap();
        assert!(p.relu().requires_grad());
    }

    #[test]
    fn test_backward_requires_scalar() {
        let p = Tensor::parameter(vec![1.0, 2.0], vec![1, 2]).unwrap();
        let err = p.relu().backward().unwrap_err();
        assert_eq!(err, TensorError::NotScalar { shape: vec![1, 2] });
    }

    #[test]
    fn test_reshape() {
        let p = Tensor::parameter(arange(6), vec![2, 3]).unwrap();
        let r = p.reshape(vec![3, 2]).unwrap();
        assert_eq!(r.shape(), vec![3, 2]);
        assert_eq!(&*r.data(), &*p.data());
        assert!(matches!(
            p.reshape(vec![4, 2]),
            Err(TensorError::InvalidReshape { .. })
        ));

        let loss = r.reshape(vec![1, 6]).unwrap().nll_loss(&[4]).unwrap();
        loss.backward().unwrap();
        assert_eq!(&*p.grad(), &[0.0, 0.0, 0.0, 0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_relu() {
        let p = Tensor::parameter(vec![-1.0, 2.0], vec![1, 2]).unwrap();
        let r = p.relu();
        assert_eq!(&*r.data(), &[0.0, 2.0]);

        // the gradient does not flow through the negative input
        r.nll_loss(&[0]).unwrap().backward().unwrap();
        assert_eq!(&*p.grad(), &[0.0, 0.0]);
    }

    #[test]
    fn test_linear() {
        let x = Tensor::parameter(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let w = Tensor::parameter(vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5], vec![2, 3]).unwrap();
        let b = Tensor::parameter(vec![0.1, -0.1], vec![2]).unwrap();
        let y = x.linear(&w, &b).unwrap();
        assert_eq!(y.shape(), vec![2, 2]);
        let expected = [-1.9, 2.9, -1.9, 7.4];
        for (got, want) in y.data().iter().zip(expected) {
            assert_eq_float!(*got, want, 1e-5);
        }

        // loss = -(y[0, 1] + y[1, 0]) / 2
        let loss = y.nll_loss(&[1, 0]).unwrap();
        assert_eq_float!(loss.item().unwrap(), -0.5, 1e-5);
        loss.backward().unwrap();
        let expected_dw = [-2.0, -2.5, -3.0, -0.5, -1.0, -1.5];
        for (got, want) in w.grad().iter().zip(expected_dw) {
            assert_eq_float!(*got, want);
        }
        assert_eq!(&*b.grad(), &[-0.5, -0.5]);
        let expected_dx = [-0.25, -0.25, -0.25, -0.5, 0.0, 0.5];
        for (got, want) in x.grad().iter().zip(expected_dx) {
            assert_eq_float!(*got, want);
        }
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let x = Tensor::zeros(vec![2, 3]);
        let w = Tensor::zeros(vec![2, 4]);
        let b = Tensor::zeros(vec![2]);
        assert!(matches!(
            x.linear(&w, &b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv2d() {
        // [[1, 2, 3], [4, 5, 6], [7, 8, 9]] with a diagonal kernel
        let x = Tensor::parameter((1..=9).map(|v| v as f32).collect(), vec![1, 1, 3, 3]).unwrap();
        let w = Tensor::parameter(vec![1.0, 0.0, 0.0, 1.0], vec![1, 1, 2, 2]).unwrap();
        let b = Tensor::parameter(vec![0.5], vec![1]).unwrap();
        let y = x.conv2d(&w, &b, 1).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 2, 2]);
        assert_eq!(&*y.data(), &[6.5, 8.5, 12.5, 14.5]);

        // loss = -y[1, 1]
        let loss = y.reshape(vec![1, 4]).unwrap().nll_loss(&[3]).unwrap();
        loss.backward().unwrap();
        assert_eq!(&*w.grad(), &[-5.0, -6.0, -8.0, -9.0]);
        assert_eq!(&*b.grad(), &[-1.0]);
        let mut expected_dx = [0.0; 9];
        expected_dx[4] = -1.0;
        expected_dx[8] = -1.0;
        assert_eq!(&*x.grad(), &expected_dx);
    }

    #[test]
    fn test_conv2d_stride() {
        let x = Tensor::new(arange(16), vec![1, 1, 4, 4]).unwrap();
        let w = Tensor::parameter(vec![1.0; 4], vec![1, 1, 2, 2]).unwrap();
        let b = Tensor::parameter(vec![0.0], vec![1]).unwrap();
        let y = x.conv2d(&w, &b, 2).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 2, 2]);
        assert_eq!(&*y.data(), &[10.0, 18.0, 42.0, 50.0]);
    }

    #[test]
    fn test_conv2d_multi_channel_shapes() {
        let x = Tensor::zeros(vec![2, 3, 8, 8]);
        let w = Tensor::zeros(vec![4, 3, 5, 5]);
        let b = Tensor::zeros(vec![4]);
        let y = x.conv2d(&w, &b, 1).unwrap();
        assert_eq!(y.shape(), vec![2, 4, 4, 4]);

        let w_bad = Tensor::zeros(vec![4, 2, 5, 5]);
        assert!(matches!(
            x.conv2d(&w_bad, &b, 1),
            Err(TensorError::ShapeMismatch { .. })
        ));
        let w_big = Tensor::zeros(vec![4, 3, 9, 9]);
        assert!(matches!(
            x.conv2d(&w_big, &b, 1),
            Err(TensorError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_max_pool2d() {
        let x = Tensor::parameter(arange(16), vec![1, 1, 4, 4]).unwrap();
        let y = x.max_pool2d(2, 2).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 2, 2]);
        assert_eq!(&*y.data(), &[5.0, 7.0, 13.0, 15.0]);

        // only the arg max of the window receives the gradient
        let loss = y.reshape(vec![1, 4]).unwrap().nll_loss(&[0]).unwrap();
        loss.backward().unwrap();
        let mut expected = [0.0; 16];
        expected[5] = -1.0;
        assert_eq!(&*x.grad(), &expected);
    }

    #[test]
    fn test_log_softmax_nll() {
        let x = Tensor::parameter(vec![1.0, 2.0], vec![1, 2]).unwrap();
        let y = x.log_softmax().unwrap();
        let probs: Vec<f32> = y.data().iter().map(|v| v.exp()).collect();
        assert_eq_float!(probs[0], 0.2689414);
        assert_eq_float!(probs[1], 0.7310586);

        let loss = y.nll_loss(&[1]).unwrap();
        assert_eq_float!(loss.item().unwrap(), 0.3132617);

        // d loss / dx = softmax(x) - one_hot(target)
        loss.backward().unwrap();
        assert_eq_float!(x.grad()[0], 0.2689414);
        assert_eq_float!(x.grad()[1], -0.2689414);
    }

    #[test]
    fn test_log_softmax_large_logits() {
        let x = Tensor::new(vec![1000.0, 1000.0], vec![1, 2]).unwrap();
        let y = x.log_softmax().unwrap();
        assert_eq_float!(y.data()[0], -(2.0f32).ln());
        assert_eq_float!(y.data()[1], -(2.0f32).ln());
    }

    #[test]
    fn test_nll_loss_errors() {
        let x = Tensor::zeros(vec![2, 3]);
        assert_eq!(
            x.nll_loss(&[0]).unwrap_err(),
            TensorError::TargetCountMismatch {
                targets: 1,
                batch: 2
            }
        );
        assert_eq!(
            x.nll_loss(&[0, 3]).unwrap_err(),
            TensorError::TargetOutOfRange {
                target: 3,
                classes: 3
            }
        );
    }

    #[test]
    fn test_gradients_accumulate() {
        let p = Tensor::parameter(vec![1.0, 2.0], vec![1, 2]).unwrap();
        p.nll_loss(&[0]).unwrap().backward().unwrap();
        p.nll_loss(&[0]).unwrap().backward().unwrap();
        assert_eq!(&*p.grad(), &[-2.0, 0.0]);

        let mut p = p;
        p.zero_grad();
        assert_eq!(&*p.grad(), &[0.0, 0.0]);
    }

    #[test]
    fn test_empty_feature_dim() {
        let empty = Tensor::zeros(vec![2, 0]);
        let err = TensorError::EmptyDim { shape: vec![2, 0] };
        assert_eq!(empty.log_softmax().unwrap_err(), err);
        assert_eq!(empty.argmax_rows().unwrap_err(), err);
        assert_eq!(empty.nll_loss(&[0, 0]).unwrap_err(), err);

        let w = Tensor::zeros(vec![3, 0]);
        let b = Tensor::zeros(vec![3]);
        assert_eq!(empty.linear(&w, &b).unwrap_err(), err);

        let x = Tensor::zeros(vec![2, 4]);
        let w = Tensor::zeros(vec![0, 4]);
        let b = Tensor::zeros(vec![0]);
        assert_eq!(
            x.linear(&w, &b).unwrap_err(),
            TensorError::EmptyDim { shape: vec![0, 4] }
        );
    }

    #[test]
    fn test_argmax_rows() {
        let x = Tensor::new(vec![0.1, 0.7, 0.2, 0.9, 0.05, 0.05], vec![2, 3]).unwrap();
        assert_eq!(x.argmax_rows().unwrap(), vec![1, 0]);
    }
}
