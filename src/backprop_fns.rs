//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Gradients are always accumulated into the inputs, and only
//! for inputs which require them.

use crate::tensor::Tensor;

/// Represents the function in the computation graph
#[derive(Debug, Clone)]
pub enum BackpropFunc {
    Reshape,
    ReLU,
    Linear,
    Conv2d { stride: usize },
    /// flat input index selected by each output element
    MaxPool2d { argmax: Vec<usize> },
    LogSoftmax,
    NllLoss { targets: Vec<usize> },
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Reshape => 1,
            BackpropFunc::ReLU => 1,
            BackpropFunc::Linear => 3,
            BackpropFunc::Conv2d { .. } => 3,
            BackpropFunc::MaxPool2d { .. } => 1,
            BackpropFunc::LogSoftmax => 1,
            BackpropFunc::NllLoss { .. } => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackpropFunc::Reshape => "reshape",
            BackpropFunc::ReLU => "relu",
            BackpropFunc::Linear => "linear",
            BackpropFunc::Conv2d { .. } => "conv2d",
            BackpropFunc::MaxPool2d { .. } => "max_pool2d",
            BackpropFunc::LogSoftmax => "log_softmax",
            BackpropFunc::NllLoss { .. } => "nll_loss",
        }
    }
}

fn accumulate(input: &Tensor, delta: &[f32]) {
    let mut inner = input.0.borrow_mut();
    if !inner.requires_grad {
        return;
    }
    debug_assert_eq!(inner.grad.len(), delta.len());
    for (g, d) in inner.grad.iter_mut().zip(delta) {
        *g += d;
    }
}

/// Represents backprop for `reshape(in) = out`
pub fn reshape(in1: &Tensor, out: &Tensor) {
    let delta = out.grad().to_vec();
    accumulate(in1, &delta);
}

/// Represents backprop for `relu(in) = out`
pub fn relu(in1: &Tensor, out: &Tensor) {
    let delta: Vec<f32> = {
        let x = in1.data();
        let grad = out.grad();
        x.iter()
            .zip(grad.iter())
            .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
            .collect()
    };
    accumulate(in1, &delta);
}

/// Represents backprop for `in @ weight^T + bias = out`
pub fn linear(in1: &Tensor, weight: &Tensor, bias: &Tensor, out: &Tensor) {
    let w_shape = weight.shape();
    let (n_out, n_in) = (w_shape[0], w_shape[1]);
    let (dx, dw, db) = {
        let x = in1.data();
        let w = weight.data();
        let grad = out.grad();
        let mut dx = vec![0.0; x.len()];
        let mut dw = vec![0.0; w.len()];
        let mut db = vec![0.0; n_out];
        for (row, g_row) in grad.chunks_exact(n_out).enumerate() {
            let x_row = &x[row * n_in..(row + 1) * n_in];
            let dx_row = &mut dx[row * n_in..(row + 1) * n_in];
            for (col, &g) in g_row.iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                db[col] += g;
                let w_row = &w[col * n_in..(col + 1) * n_in];
                let dw_row = &mut dw[col * n_in..(col + 1) * n_in];
                for k in 0..n_in {
                    dx_row[k] += g * w_row[k];
                    dw_row[k] += g * x_row[k];
                }
            }
        }
        (dx, dw, db)
    };
    accumulate(in1, &dx);
    accumulate(weight, &dw);
    accumulate(bias, &db);
}

/// Represents backprop for `conv2d(in, weight, bias) = out` (no padding)
pub fn conv2d(in1: &Tensor, weight: &Tensor, bias: &Tensor, out: &Tensor, stride: usize) {
    let (x_shape, w_shape, out_shape) = (in1.shape(), weight.shape(), out.shape());
    let (c, h, w) = (x_shape[1], x_shape[2], x_shape[3]);
    let (n_out, kh, kw) = (w_shape[0], w_shape[2], w_shape[3]);
    let (oh, ow) = (out_shape[2], out_shape[3]);
    // the input of the first layer is data, skip its gradient
    let need_dx = in1.requires_grad();

    let (dx, dk, db) = {
        let x = in1.data();
        let k = weight.data();
        let grad = out.grad();
        let mut dx = vec![0.0; x.len()];
        let mut dk = vec![0.0; k.len()];
        let mut db = vec![0.0; n_out];
        for (out_idx, &g) in grad.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            let ox = out_idx % ow;
            let oy = (out_idx / ow) % oh;
            let oc = (out_idx / (ow * oh)) % n_out;
            let batch = out_idx / (ow * oh * n_out);
            db[oc] += g;
            for ic in 0..c {
                for ky in 0..kh {
                    let x_row = ((batch * c + ic) * h + oy * stride + ky) * w + ox * stride;
                    let k_row = ((oc * c + ic) * kh + ky) * kw;
                    for kx in 0..kw {
                        dk[k_row + kx] += g * x[x_row + kx];
                    }
                    if need_dx {
                        for kx in 0..kw {
                            dx[x_row + kx] += g * k[k_row + kx];
                        }
                    }
                }
            }
        }
        (dx, dk, db)
    };
    accumulate(in1, &dx);
    accumulate(weight, &dk);
    accumulate(bias, &db);
}

/// Represents backprop for `max_pool2d(in) = out`, the gradient is routed to the arg max
pub fn max_pool2d(in1: &Tensor, out: &Tensor, argmax: &[usize]) {
    let delta = {
        let grad = out.grad();
        let mut delta = vec![0.0; in1.numel()];
        for (&idx, g) in argmax.iter().zip(grad.iter()) {
            delta[idx] += g;
        }
        delta
    };
    accumulate(in1, &delta);
}

/// Represents backprop for `log_softmax(in) = out` over the last dimension
/// d out_j / d in_i = 1[i == j] - softmax_i
pub fn log_softmax(in1: &Tensor, out: &Tensor) {
    let classes = out.shape()[1];
    let delta = {
        let y = out.data();
        let grad = out.grad();
        let mut delta = Vec::with_capacity(y.len());
        for (y_row, g_row) in y.chunks_exact(classes).zip(grad.chunks_exact(classes)) {
            let g_sum = g_row.iter().sum::<f32>();
            delta.extend(y_row.iter().zip(g_row).map(|(y, g)| g - y.exp() * g_sum));
        }
        delta
    };
    accumulate(in1, &delta);
}

/// Represents backprop for the mean negative log likelihood `nll(in, targets) = out`
pub fn nll_loss(in1: &Tensor, out: &Tensor, targets: &[usize]) {
    let classes = in1.shape()[1];
    let scale = -out.grad()[0] / targets.len() as f32;
    let mut delta = vec![0.0; in1.numel()];
    for (row, &t) in targets.iter().enumerate() {
        delta[row * classes + t] += scale;
    }
    accumulate(in1, &delta);
}

/// Applies the backprop function which created `out` to its children
pub fn update_gradients(out: &Tensor) {
    let inner = out.0.borrow();
    let Some(backprop_fn) = &inner.backprop_fn else {
        return;
    };
    debug_assert_eq!(backprop_fn.n_operands(), inner.children.len());
    let child = |i: usize| Tensor(inner.children[i].clone());
    match backprop_fn {
        BackpropFunc::Reshape => reshape(&child(0), out),
        BackpropFunc::ReLU => relu(&child(0), out),
        BackpropFunc::Linear => linear(&child(0), &child(1), &child(2), out),
        BackpropFunc::Conv2d { stride } => conv2d(&child(0), &child(1), &child(2), out, *stride),
        BackpropFunc::MaxPool2d { argmax } => max_pool2d(&child(0), out, argmax),
        BackpropFunc::LogSoftmax => log_softmax(&child(0), out),
        BackpropFunc::NllLoss { targets } => nll_loss(&child(0), out, targets),
    }
}
