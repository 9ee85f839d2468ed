//! Parameter update rules.
//!
//! Every trainable layer uses gradient descent with momentum: accumulated
//! updates are applied with `learning_rate / batch` and then decayed by
//! `momentum`. Weight matrices additionally receive L2 decay.

pub mod sgd;

pub use sgd::UpdateArgs;
