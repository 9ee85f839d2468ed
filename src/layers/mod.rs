//! Layer abstractions and implementations
//!
//! Every layer kind implements the [`Layer`] trait. Layers own their `output`
//! and `delta` buffers and receive everything else through a
//! [`NetworkState`](crate::state::NetworkState).

mod r#trait;
pub mod avgpool;
pub mod batchnorm;
pub mod connected;
pub mod cost;
pub mod dropout;
pub mod rnn;

pub use avgpool::AvgPoolLayer;
pub use batchnorm::{BatchNorm, BatchNormLayer};
pub use connected::ConnectedLayer;
pub use cost::{CostLayer, CostType, SECRET_NUM};
pub use dropout::{DropBlock, DropoutLayer};
pub use r#trait::{Layer, LayerKind, Shape};
pub use rnn::{RnnLayer, RnnOptions};
