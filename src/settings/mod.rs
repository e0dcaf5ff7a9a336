//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables with the `FEDHEART__` prefix. An example configuration file can
//! be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use derive_more::Display;
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize, Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    #[validate]
    pub training: TrainingSettings,
    #[serde(default)]
    pub round: RoundSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedheart").separator("__"))?;
        config.try_into()
    }
}

/// The gradient-based optimizer a client instantiates for local training.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[display(fmt = "adam")]
    Adam,
    #[display(fmt = "sgd")]
    Sgd,
}

/// The per-run training configuration, read-only to every component.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [training]
/// epochs = 5
/// learning_rate = 0.001
/// batch_size = 4
/// optimizer = "adam"
/// clients_per_round = 4
/// experiment_name = "fed-heart-disease"
/// weight_decay = 0.0
/// ```
///
/// **Environment variables**
/// ```text
/// FEDHEART__TRAINING__EPOCHS=5
/// FEDHEART__TRAINING__LEARNING_RATE=0.001
/// ```
#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_training"))]
pub struct TrainingSettings {
    /// The number of local epochs per training round. Must be positive.
    pub epochs: u32,
    /// The local learning rate. Must be a positive finite number.
    pub learning_rate: f64,
    /// The local batch size. Must be positive.
    pub batch_size: usize,
    /// The optimizer every client instantiates locally.
    pub optimizer: OptimizerKind,
    /// The number of clients selected each round. Must be positive.
    pub clients_per_round: usize,
    /// The experiment name under which telemetry is grouped. Must not be
    /// empty.
    pub experiment_name: String,
    /// The optimizer weight decay. Must not be negative.
    #[serde(default)]
    pub weight_decay: f64,
}

impl TrainingSettings {
    fn validate_training(&self) -> Result<(), ValidationError> {
        if self.epochs == 0 {
            return Err(ValidationError::new("epochs must be positive"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ValidationError::new(
                "learning_rate must be a positive finite number",
            ));
        }
        if self.batch_size == 0 {
            return Err(ValidationError::new("batch_size must be positive"));
        }
        if self.clients_per_round == 0 {
            return Err(ValidationError::new("clients_per_round must be positive"));
        }
        if self.experiment_name.is_empty() {
            return Err(ValidationError::new("experiment_name must not be empty"));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ValidationError::new("weight_decay must not be negative"));
        }
        Ok(())
    }
}

fn validate_training(settings: &TrainingSettings) -> Result<(), ValidationError> {
    settings.validate_training()
}

/// Round execution settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RoundSettings {
    /// An optional per-client deadline within a round, in seconds. A client
    /// that has not reported when it expires contributes zero weight for
    /// that round.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHEART__LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Default for TrainingSettings {
        fn default() -> Self {
            Self {
                epochs: 1,
                learning_rate: 0.001,
                batch_size: 4,
                optimizer: OptimizerKind::Adam,
                clients_per_round: 2,
                experiment_name: "fed-heart-disease".to_string(),
                weight_decay: 0.0,
            }
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn default_training_settings_validate() {
        assert!(TrainingSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_epochs_fail_validation() {
        let settings = TrainingSettings {
            epochs: 0,
            ..TrainingSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_positive_learning_rate_fails_validation() {
        let settings = TrainingSettings {
            learning_rate: 0.0,
            ..TrainingSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn negative_weight_decay_fails_validation() {
        let settings = TrainingSettings {
            weight_decay: -0.1,
            ..TrainingSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn optimizer_kind_displays_its_config_name() {
        assert_eq!(OptimizerKind::Adam.to_string(), "adam");
        assert_eq!(OptimizerKind::Sgd.to_string(), "sgd");
    }
}
