//! A small training pipeline for MNIST: tensors with reverse mode autodiff, a PyTorch-like
//! layer API, the dataset and data loader, and a trainer with checkpoints and monitors.

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod file_structure;
pub mod loss;
pub mod model;
pub mod monitoring;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train_config;
pub mod trainer;
pub mod transforms;
