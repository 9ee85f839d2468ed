//! Neural network layer core
//!
//! Layer kinds sharing one forward/backward/update/resize contract over flat
//! `f32` buffers: connected, recurrent, batch normalization, average pooling,
//! dropout and cost.
//!
//! # Modules
//!
//! - `layers`: Layer trait and implementations (Connected, RNN, BatchNorm, etc.)
//! - `state`: Per-call context handed to every layer
//! - `optimizers`: Momentum SGD update arguments
//! - `accelerator`: Device boundary and the in-memory reference backend
//! - `utils`: Shared utilities (RNG, activation functions)
//! - `config`: Network hyperparameters loaded from JSON
//! - `architecture`: Architecture configuration and model building
//! - `report`: Construction-time reporting collaborators

pub mod accelerator;
pub mod architecture;
pub mod config;
pub mod error;
pub mod layers;
pub mod optimizers;
pub mod report;
pub mod state;
pub mod utils;

pub use error::LayerError;
