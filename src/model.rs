//! Unit-risk classifier: pre-trained binary model over the 52-element
//! feature vector.
//!
//! The artifact is a JSON weights file (single dense layer + bias mapped
//! through a sigmoid) produced by the offline training pipeline. It is
//! loaded **once per process**: the server holds the parsed model behind a
//! lazily-initialized shared handle and reuses it across requests; the
//! parsed model is immutable and safe for concurrent inference.
//!
//! Any load or inference failure is fatal to the calling request: the risk
//! score is part of the verification response contract, so unlike the
//! notification side-channel it is surfaced to the caller.

use std::path::Path;

use eyre::{bail, Result, WrapErr};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::features::FEATURE_LEN;

/// Default on-disk location of the weights artifact.
pub const DEFAULT_MODEL_PATH: &str = "models/unit-risk.json";

/// Serialized form of the trained artifact.
#[derive(Debug, Deserialize)]
struct ModelArtifact {
    #[serde(default)]
    version: String,
    weights: Vec<f32>,
    bias: f32,
}

/// A loaded, validated risk model.
pub struct RiskModel {
    version: String,
    weights: Vec<f32>,
    bias: f32,
    hash: String,
}

/// Output of one inference call.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    /// 0 = low risk, 1 = high risk.
    pub label: i64,
    /// Probability of the **predicted** label (indexed by the label, not
    /// the positive class).
    pub probability: f32,
    /// Full distribution: `[p(label 0), p(label 1)]`.
    pub probabilities: [f32; 2],
}

impl RiskModel {
    /// Load and validate the artifact at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("Failed to read model artifact at {}", path.display()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("sha256:{}", hex::encode(hasher.finalize()));

        let artifact: ModelArtifact = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("Invalid model artifact at {}", path.display()))?;

        if artifact.weights.len() != FEATURE_LEN {
            bail!(
                "Model artifact has {} weights, expected {}",
                artifact.weights.len(),
                FEATURE_LEN
            );
        }
        if artifact.weights.iter().any(|w| !w.is_finite()) || !artifact.bias.is_finite() {
            bail!("Model artifact contains non-finite parameters");
        }

        tracing::info!(
            path = %path.display(),
            version = %artifact.version,
            hash = %hash,
            "risk model loaded"
        );

        Ok(Self {
            version: artifact.version,
            weights: artifact.weights,
            bias: artifact.bias,
            hash,
        })
    }

    /// Score a single feature vector.
    ///
    /// The input must be exactly [`FEATURE_LEN`] wide (a `[1, 52]` batch of
    /// one row); anything else is a shape error.
    pub fn predict(&self, features: &[f32]) -> Result<Prediction> {
        if features.len() != FEATURE_LEN {
            bail!(
                "Feature vector has {} elements, expected {}",
                features.len(),
                FEATURE_LEN
            );
        }

        let logit: f32 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + self.bias;

        if !logit.is_finite() {
            bail!("Inference produced a non-finite logit");
        }

        let p_high = 1.0 / (1.0 + (-logit).exp());
        let probabilities = [1.0 - p_high, p_high];
        let label: i64 = i64::from(p_high >= 0.5);
        let probability = probabilities[label as usize];

        Ok(Prediction {
            label,
            probability,
            probabilities,
        })
    }

    /// SHA-256 of the artifact bytes, for health reporting and audit.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}
