//! Risk feature builder: fixed-length numeric encoding of spatial, temporal,
//! and historical signals for the unit-risk classifier.
//!
//! The 52-element layout is a strict schema contract with the trained
//! artifact: same field order, same one-hot scheme. Shape drift breaks
//! inference, so the layout is spelled out index by index in
//! [`RiskContext::to_feature_vec`] and pinned by tests.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Length of the classifier's input vector.
pub const FEATURE_LEN: usize = 52;

/// Deployment-local UTC offset in hours (WAT, UTC+1). Temporal buckets are
/// local-time buckets: the classifier was trained on local scan times, so a
/// 17:30 local scan must encode as evening, not as its 16:30 UTC hour.
const LOCAL_UTC_OFFSET_HOURS: i32 = 1;

fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(LOCAL_UTC_OFFSET_HOURS * 3600).expect("valid fixed offset constant")
}

/// Baseline user risk for a scan attributable to an identified consumer.
const BASELINE_IDENTIFIED: f32 = 0.3;
/// Baseline user risk for an anonymous scan.
const BASELINE_ANONYMOUS: f32 = 0.6;

/// Region one-hot vocabulary: the 36 states plus the Federal Capital
/// Territory of the deployment geography. Unknown regions encode as an
/// all-zero region block.
pub const REGIONS: [&str; 37] = [
    "Abia", "Adamawa", "Akwa Ibom", "Anambra", "Bauchi", "Bayelsa", "Benue", "Borno",
    "Cross River", "Delta", "Ebonyi", "Edo", "Ekiti", "Enugu", "FCT", "Gombe", "Imo", "Jigawa",
    "Kaduna", "Kano", "Katsina", "Kebbi", "Kogi", "Kwara", "Lagos", "Nasarawa", "Niger", "Ogun",
    "Ondo", "Osun", "Oyo", "Plateau", "Rivers", "Sokoto", "Taraba", "Yobe", "Zamfara",
];

/// Coarse time-of-day bucket by local hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Bucket boundaries: morning [5,12), afternoon [12,17), evening
    /// [17,21), night otherwise.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Morning => 0,
            Self::Afternoon => 1,
            Self::Evening => 2,
            Self::Night => 3,
        }
    }
}

/// Combined user-risk flag: a bounded linear blend of a baseline (anonymous
/// scans start riskier) and the relevant suspicious-scan ratio.
///
/// `min(baseline + ratio * 0.5, 1.0)`: never exceeds 1, never below the
/// baseline for a non-negative ratio.
pub fn user_risk_flag(identified: bool, suspicious_ratio: f32) -> f32 {
    let baseline = if identified {
        BASELINE_IDENTIFIED
    } else {
        BASELINE_ANONYMOUS
    };
    (baseline + suspicious_ratio.max(0.0) * 0.5).min(1.0)
}

/// Index of a region in the one-hot vocabulary, case-insensitive.
fn region_index(region: &str) -> Option<usize> {
    REGIONS
        .iter()
        .position(|r| r.eq_ignore_ascii_case(region.trim()))
}

/// Everything the feature builder needs about one scan.
#[derive(Debug, Clone)]
pub struct RiskContext {
    /// Region/state of the batch's owning organization.
    pub region: String,
    /// Scan coordinates; parse failures upstream arrive here as 0.
    pub latitude: f32,
    pub longitude: f32,
    pub scanned_at: DateTime<Utc>,
    /// Suspicious-scan ratio for the region over the trailing 30 days
    /// (0 when the region has no prior scans).
    pub regional_incident_rate: f32,
    /// Output of [`user_risk_flag`].
    pub user_risk_flag: f32,
}

impl RiskContext {
    /// Encode into the classifier's fixed input layout.
    ///
    /// Layout (strict contract with the trained artifact):
    ///   0      latitude / 90, clamped to [-1, 1]
    ///   1      longitude / 180, clamped to [-1, 1]
    ///   2      regional 30-day incident rate
    ///   3      combined user-risk flag
    ///   4..8   local time-of-day one-hot (morning, afternoon, evening, night)
    ///   8..15  local day-of-week one-hot (Monday..Sunday)
    ///   15..52 region one-hot over [`REGIONS`]
    pub fn to_feature_vec(&self) -> [f32; FEATURE_LEN] {
        let mut v = [0.0f32; FEATURE_LEN];

        v[0] = (self.latitude / 90.0).clamp(-1.0, 1.0);
        v[1] = (self.longitude / 180.0).clamp(-1.0, 1.0);
        v[2] = self.regional_incident_rate.clamp(0.0, 1.0);
        v[3] = self.user_risk_flag.clamp(0.0, 1.0);

        let local = self.scanned_at.with_timezone(&local_offset());

        let tod = TimeOfDay::from_hour(local.hour());
        v[4 + tod.index()] = 1.0;

        let weekday = local.weekday().num_days_from_monday() as usize;
        v[8 + weekday] = 1.0;

        if let Some(idx) = region_index(&self.region) {
            v[15 + idx] = 1.0;
        }

        v
    }
}
