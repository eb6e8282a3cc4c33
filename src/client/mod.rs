//! Client-side counterpart of the replication protocol: local prediction,
//! reconciliation and interpolated rendering of remote entities

pub mod interpolation;
pub mod predictor;

pub use interpolation::{Interpolator, RenderedEntity};
pub use predictor::{ClientConfig, ClientError, ClientPredictor, PendingInput, Reconciliation};
