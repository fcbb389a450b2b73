use std::{fs, num::NonZeroUsize, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The specification for the `ClientStage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    pub in_channels: usize,
    pub input_hw: (usize, usize),
    pub width: usize,
    pub aux_pool: (usize, usize),
    pub classes: usize,
}

impl Default for ClientSpec {
    fn default() -> Self {
        Self {
            in_channels: 3,
            input_hw: (32, 32),
            width: 64,
            aux_pool: (2, 2),
            classes: 10,
        }
    }
}

/// The specification for the `ServerStage`. Every width adds a residual stage of stride 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    pub in_channels: usize,
    pub input_hw: (usize, usize),
    pub widths: Vec<usize>,
    pub classes: usize,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            in_channels: 64,
            input_hw: (32, 32),
            widths: vec![128, 256, 512],
            classes: 10,
        }
    }
}

/// The specification for the `GradEstimator` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorSpec {
    Stein {
        sigma: f32,
        samples: NonZeroUsize,
        antithetic: bool,
        seed: Option<u64>,
    },
}

impl Default for EstimatorSpec {
    fn default() -> Self {
        Self::Stein {
            sigma: 1e-3,
            samples: NonZeroUsize::MIN,
            antithetic: false,
            seed: None,
        }
    }
}

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    GradientDescent { learning_rate: f32 },
    GradientDescentWithMomentum { learning_rate: f32, momentum: f32 },
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::GradientDescentWithMomentum {
            learning_rate: 0.01,
            momentum: 0.9,
        }
    }
}

/// How the client half learns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSpec {
    #[default]
    Backprop,
    LocalLoss,
    EstimateGrad,
}

/// The specification for the synthetic `Dataset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    pub size: usize,
    pub noise: f32,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            size: 64,
            noise: 0.5,
        }
    }
}

/// The specification for the `Trainer` trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSpec {
    pub client: ClientSpec,
    pub server: ServerSpec,
    pub estimator: EstimatorSpec,
    pub optimizer: OptimizerSpec,
    pub mode: ModeSpec,
    pub dataset: DatasetSpec,
    pub epochs: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub seed: Option<u64>,
}

impl Default for TrainerSpec {
    fn default() -> Self {
        Self {
            client: ClientSpec::default(),
            server: ServerSpec::default(),
            estimator: EstimatorSpec::default(),
            optimizer: OptimizerSpec::default(),
            mode: ModeSpec::default(),
            dataset: DatasetSpec::default(),
            epochs: NonZeroUsize::MIN,
            batch_size: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            seed: None,
        }
    }
}

impl TrainerSpec {
    /// Reads a `TrainerSpec` from a JSON file, filling the missing fields with the defaults.
    ///
    /// # Arguments
    /// * `path` - The path of the file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_resnet18_split() {
        let spec = TrainerSpec::default();

        assert_eq!(spec.client.width, spec.server.in_channels);
        assert_eq!(spec.client.input_hw, spec.server.input_hw);
        assert_eq!(spec.server.widths, [128, 256, 512]);
        assert_eq!(spec.client.classes, 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{
            "mode": "estimate_grad",
            "estimator": { "stein": { "sigma": 0.01, "samples": 4, "antithetic": true, "seed": 7 } },
            "client": { "width": 16 },
            "batch_size": 8
        }"#;
        let spec: TrainerSpec = serde_json::from_str(raw).unwrap();

        assert_eq!(spec.mode, ModeSpec::EstimateGrad);
        assert_eq!(spec.client.width, 16);
        assert_eq!(spec.client.input_hw, (32, 32));
        assert_eq!(spec.batch_size.get(), 8);
        assert!(matches!(
            spec.estimator,
            EstimatorSpec::Stein { antithetic: true, seed: Some(7), .. }
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let raw = r#"{ "batch_size": 0 }"#;
        assert!(serde_json::from_str::<TrainerSpec>(raw).is_err());
    }
}
