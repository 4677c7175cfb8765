//! medtrace: pharmaceutical unit verification service.
//!
//! Verifies consumer QR scans of serialized drug units: checks the signed
//! QR tuple against the issuing secret, replays the batch's append-only
//! event log from the registry mirror, applies the authenticity rules,
//! records the scan, notifies the owning organization, and scores the scan
//! with the in-process risk classifier.
//!
//! Logging uses `tracing`; set `RUST_LOG` (e.g. `RUST_LOG=medtrace=debug`)
//! to control verbosity.

pub mod checks;
pub mod features;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod server;
pub mod signature;
pub mod store;

use eyre::Result;
use tracing::debug;

use features::RiskContext;
use model::{Prediction, RiskModel};

/// Build the feature vector for a scan context and score it.
pub fn score_risk(model: &RiskModel, context: &RiskContext) -> Result<Prediction> {
    let features = context.to_feature_vec();
    debug!(
        region = %context.region,
        incident_rate = context.regional_incident_rate,
        user_risk_flag = context.user_risk_flag,
        "scoring scan risk"
    );
    let prediction = model.predict(&features)?;
    debug!(
        label = prediction.label,
        probability = prediction.probability,
        "risk prediction"
    );
    Ok(prediction)
}
