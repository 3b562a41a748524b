//! Sampling strategies layered on top of a [`crate::DiffusionModel`].
//!
//! A sampler does not predict noise itself; it decides *which* timesteps the model visits and with how much noise,
//! temporarily installing derived sub-schedules on the model and restoring the original afterwards.

mod restart;
pub use self::restart::*;
