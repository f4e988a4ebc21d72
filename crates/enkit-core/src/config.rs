//! Exposure scoring configuration and risk estimation.
//!
//! Health authorities tune detection through four 8-entry level-value
//! tables (attenuation, days-since-exposure, duration, transmission
//! risk), per-category weights, and minimum-score gates. The risk score
//! of an exposure is the product of the four weighted factors; records
//! falling below either minimum are withheld from summaries.
//!
//! Two independent bucket grids consume the attenuation tables:
//!
//! - the **fine grid** (`{10, 15, 27, 33, 51, 63, 73, 255}`) drives the
//!   duration-weighted `attenuation_value` of an exposure record. Its
//!   bucket indices run from strongest signal to weakest, while the level
//!   table is ordered weakest-first, so the index is reversed before the
//!   table lookup;
//! - the **coarse grid** (caller-supplied thresholds, default `[50, 70]`)
//!   splits exposure duration into the per-bucket durations reported to
//!   clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExposureInfo;

/// Entries in each level-value table.
pub const RISK_LEVEL_COUNT: usize = 8;

/// Fixed thresholds of the fine attenuation grid.
pub const FINE_ATTENUATION_THRESHOLDS: [u8; RISK_LEVEL_COUNT] = [10, 15, 27, 33, 51, 63, 73, 255];

/// Default coarse attenuation-duration thresholds.
pub const DEFAULT_ATTENUATION_DURATION_THRESHOLDS: [u8; 2] = [50, 70];

/// Number of coarse attenuation-duration buckets on an exposure record.
pub const ATTENUATION_BUCKET_COUNT: usize = 4;

/// Errors produced when validating a configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The coarse threshold list had the wrong shape.
    #[error("attenuation duration thresholds must be 2 or 3 ascending values, got {got:?}")]
    InvalidThresholds {
        /// The rejected threshold list.
        got: Vec<u8>,
    },

    /// A weight was negative or non-finite.
    #[error("invalid {what} weight: {value}")]
    InvalidWeight {
        /// Which weight was rejected.
        what: &'static str,
        /// The rejected value.
        value: f64,
    },
}

/// Scoring policy for a detection session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfiguration {
    /// Level values indexed by reversed fine attenuation bucket.
    pub attenuation_level_values: [f64; RISK_LEVEL_COUNT],
    /// Level values stepped by days since the exposure.
    pub days_since_last_exposure_level_values: [f64; RISK_LEVEL_COUNT],
    /// Level values stepped by cumulative exposure duration.
    pub duration_level_values: [f64; RISK_LEVEL_COUNT],
    /// Level values indexed by the TEK's transmission risk level.
    pub transmission_risk_level_values: [f64; RISK_LEVEL_COUNT],
    /// Multiplier applied to the attenuation factor.
    pub attenuation_weight: f64,
    /// Multiplier applied to the days-since-exposure factor.
    pub days_since_last_exposure_weight: f64,
    /// Multiplier applied to the duration factor.
    pub duration_weight: f64,
    /// Multiplier applied to the transmission-risk factor.
    pub transmission_risk_weight: f64,
    /// Coarse bucket thresholds: 2 or 3 ascending values.
    pub attenuation_duration_thresholds: Vec<u8>,
    /// Minimum clamped score for a record to reach the summary.
    pub minimum_risk_score: u8,
    /// Minimum unclamped score for a record to reach the summary.
    pub minimum_risk_score_full_range: f64,
}

impl Default for ExposureConfiguration {
    fn default() -> Self {
        Self {
            attenuation_level_values: [1.0; RISK_LEVEL_COUNT],
            days_since_last_exposure_level_values: [1.0; RISK_LEVEL_COUNT],
            duration_level_values: [1.0; RISK_LEVEL_COUNT],
            transmission_risk_level_values: [1.0; RISK_LEVEL_COUNT],
            attenuation_weight: 1.0,
            days_since_last_exposure_weight: 1.0,
            duration_weight: 1.0,
            transmission_risk_weight: 1.0,
            attenuation_duration_thresholds: DEFAULT_ATTENUATION_DURATION_THRESHOLDS.to_vec(),
            minimum_risk_score: 0,
            minimum_risk_score_full_range: 0.0,
        }
    }
}

impl ExposureConfiguration {
    /// Checks threshold shape and weight sanity.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = &self.attenuation_duration_thresholds;
        let ascending = thresholds.windows(2).all(|w| w[0] < w[1]);
        if !(2..=3).contains(&thresholds.len()) || !ascending {
            return Err(ConfigError::InvalidThresholds {
                got: thresholds.clone(),
            });
        }
        for (what, value) in [
            ("attenuation", self.attenuation_weight),
            ("days", self.days_since_last_exposure_weight),
            ("duration", self.duration_weight),
            ("transmission risk", self.transmission_risk_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { what, value });
            }
        }
        Ok(())
    }

    /// Index into the fine attenuation grid: the lowest bucket whose
    /// threshold the attenuation does not exceed.
    #[must_use]
    pub fn fine_attenuation_bucket(attenuation: u8) -> usize {
        FINE_ATTENUATION_THRESHOLDS
            .iter()
            .position(|&threshold| attenuation <= threshold)
            .unwrap_or(RISK_LEVEL_COUNT - 1)
    }

    /// Level value for a fine-grid bucket, with the index reversal the
    /// table ordering requires.
    #[must_use]
    pub fn attenuation_level_value_for_bucket(&self, fine_bucket: usize) -> f64 {
        self.attenuation_level_values[RISK_LEVEL_COUNT - 1 - fine_bucket.min(RISK_LEVEL_COUNT - 1)]
    }

    /// Level value for days elapsed since an exposure; more recent
    /// exposures select higher table indices.
    #[must_use]
    pub fn days_since_last_exposure_level_value(&self, days: i64) -> f64 {
        let values = &self.days_since_last_exposure_level_values;
        match days {
            d if d >= 14 => values[0],
            d if d >= 12 => values[1],
            d if d >= 10 => values[2],
            d if d >= 8 => values[3],
            d if d >= 6 => values[4],
            d if d >= 4 => values[5],
            d if d >= 2 => values[6],
            _ => values[7],
        }
    }

    /// Level value for a cumulative exposure duration in seconds,
    /// stepped at 5-minute boundaries.
    #[must_use]
    pub fn duration_level_value(&self, duration_secs: u32) -> f64 {
        let values = &self.duration_level_values;
        match duration_secs {
            0 => values[0],
            d if d <= 300 => values[1],
            d if d <= 600 => values[2],
            d if d <= 900 => values[3],
            d if d <= 1_200 => values[4],
            d if d <= 1_500 => values[5],
            d if d <= 1_800 => values[6],
            _ => values[7],
        }
    }

    /// Level value for a transmission risk level, clamped to the table.
    #[must_use]
    pub fn transmission_risk_level_value(&self, risk_level: u8) -> f64 {
        self.transmission_risk_level_values[usize::from(risk_level).min(RISK_LEVEL_COUNT - 1)]
    }

    /// The four coarse thresholds, caller values padded with 255.
    #[must_use]
    pub fn coarse_thresholds(&self) -> [u8; ATTENUATION_BUCKET_COUNT] {
        let mut thresholds = [u8::MAX; ATTENUATION_BUCKET_COUNT];
        for (slot, &value) in thresholds
            .iter_mut()
            .zip(self.attenuation_duration_thresholds.iter())
        {
            *slot = value;
        }
        thresholds
    }

    /// Index into the coarse grid: the lowest bucket whose threshold the
    /// attenuation does not exceed.
    #[must_use]
    pub fn coarse_attenuation_bucket(&self, attenuation: u8) -> usize {
        self.coarse_thresholds()
            .iter()
            .position(|&threshold| attenuation <= threshold)
            .unwrap_or(ATTENUATION_BUCKET_COUNT - 1)
    }

    /// Computes the risk score of an exposure record.
    ///
    /// Returns the unclamped product of the four weighted factors and
    /// its rounded 8-bit clamp.
    #[must_use]
    pub fn risk_score(&self, info: &ExposureInfo, days_since_exposure: i64) -> (f64, u8) {
        let attenuation_factor = f64::from(info.attenuation_value) * self.attenuation_weight;
        let days_factor = self.days_since_last_exposure_level_value(days_since_exposure)
            * self.days_since_last_exposure_weight;
        let duration_factor =
            self.duration_level_value(u32::from(info.duration)) * self.duration_weight;
        let transmission_factor = self
            .transmission_risk_level_value(info.transmission_risk_level)
            * self.transmission_risk_weight;

        let full_range = attenuation_factor * days_factor * duration_factor * transmission_factor;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let clamped = full_range.round().clamp(0.0, 255.0) as u8;
        (full_range, clamped)
    }

    /// Whether a scored record passes both minimum-score gates.
    #[must_use]
    pub fn admits(&self, full_range: f64, clamped: u8) -> bool {
        clamped >= self.minimum_risk_score && full_range >= self.minimum_risk_score_full_range
    }
}
