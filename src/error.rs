//! Configuration errors.
//!
//! None of the estimators fail while stepping. These errors are only produced
//! by the explicit `validate` methods and the checked constructors, so hosts
//! can reject a bad tuning before the control loop starts.

use thiserror::Error;

/// A configuration value that would make an estimator numerically meaningless.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A noise covariance was zero, negative or not finite.
    #[error("{name} must be a finite, strictly positive covariance, got {value}")]
    NonPositiveCovariance {
        /// Name of the offending parameter.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A filter gain was negative or not finite.
    #[error("{name} must be a finite, non-negative gain, got {value}")]
    InvalidGain {
        /// Name of the offending parameter.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A calibration vector or matrix contained NaN or infinity.
    #[error("{name} contains non-finite entries")]
    NonFiniteCalibration {
        /// Name of the offending parameter.
        name: &'static str,
    },
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

pub(crate) fn check_covariance(name: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositiveCovariance { name, value })
    }
}

pub(crate) fn check_gain(name: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidGain { name, value })
    }
}

pub(crate) fn check_finite<'a>(
    name: &'static str,
    values: impl IntoIterator<Item = &'a f64>,
) -> ConfigResult<()> {
    if values.into_iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(ConfigError::NonFiniteCalibration { name })
    }
}
