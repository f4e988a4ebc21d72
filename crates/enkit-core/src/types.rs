//! Shared data model for the detection pipeline.
//!
//! Timestamps throughout are Unix seconds (`i64`); the protocol's own
//! clock is the ENIN, a 10-minute interval index anchored at the Unix
//! epoch. Calendar handling only enters at the edges, where exposure
//! records floor their earliest observation to a UTC day.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::crypto::{AEM_LEN, RPI_LEN, RSSI_SATURATED, TEK_LEN, TEK_ROLLING_PERIOD};

/// Seconds covered by one Exposure Notification Interval Number.
pub const ENIN_DURATION_SECS: i64 = 600;

/// Seconds per day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Advertisements older than this are never matched.
pub const ADVERTISEMENT_RETENTION_SECS: i64 = 14 * SECONDS_PER_DAY;

/// Granularity reported durations are rounded up to.
pub const DURATION_INCREMENT_SECS: u32 = 60;

/// Cap applied to reported durations (30 minutes).
pub const DURATION_MAX_SECS: u32 = 30 * 60;

/// `daily_key_index` sentinel marking a match the pipeline has rejected.
pub const INVALID_DAILY_KEY_INDEX: u32 = u32::MAX;

/// Converts a Unix timestamp to its Exposure Notification Interval Number.
#[must_use]
pub const fn enin_from_unix(timestamp: i64) -> i64 {
    timestamp.div_euclid(ENIN_DURATION_SECS)
}

/// Floors a Unix timestamp to the start of its UTC day.
#[must_use]
pub fn floor_to_utc_day(timestamp: i64) -> DateTime<Utc> {
    let floored = timestamp.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY;
    DateTime::from_timestamp(floored, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Rounds a duration up to the next minute, capped at 30 minutes.
#[must_use]
pub const fn round_reported_duration(seconds: u32) -> u32 {
    let rounded = seconds.div_ceil(DURATION_INCREMENT_SECS) * DURATION_INCREMENT_SECS;
    if rounded > DURATION_MAX_SECS {
        DURATION_MAX_SECS
    } else {
        rounded
    }
}

/// A diagnosed user's Temporary Exposure Key as read from an export file.
#[derive(Clone)]
pub struct TemporaryExposureKey {
    /// The 16 secret key bytes.
    pub key_data: [u8; TEK_LEN],
    /// ENIN at which the key became current.
    pub rolling_start_number: u32,
    /// Number of 10-minute intervals the key was used for, when present.
    pub rolling_period: Option<u32>,
    /// Transmission risk level assigned by the health authority (0..=7).
    pub transmission_risk_level: u8,
}

impl TemporaryExposureKey {
    /// Number of RPI slots this key actually covers, clamped to a day.
    #[must_use]
    pub fn effective_rolling_period(&self) -> u32 {
        self.rolling_period
            .unwrap_or(TEK_ROLLING_PERIOD)
            .min(TEK_ROLLING_PERIOD)
    }

    /// Whether the declared rolling period invalidates the whole key.
    #[must_use]
    pub fn exceeds_rolling_period(&self) -> bool {
        self.rolling_period
            .is_some_and(|period| period > TEK_ROLLING_PERIOD)
    }

    /// Constant-time comparison of the key bytes, used for dedup.
    #[must_use]
    pub fn key_eq(&self, other: &Self) -> bool {
        self.key_data.ct_eq(&other.key_data).into()
    }
}

// Key bytes stay out of Debug output.
impl std::fmt::Debug for TemporaryExposureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryExposureKey")
            .field("key_data", &"[REDACTED]")
            .field("rolling_start_number", &self.rolling_start_number)
            .field("rolling_period", &self.rolling_period)
            .field("transmission_risk_level", &self.transmission_risk_level)
            .finish()
    }
}

/// One observed BLE advertisement row, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Rolling Proximity Identifier carried by the advertisement.
    pub rpi: [u8; RPI_LEN],
    /// Associated Encrypted Metadata, still encrypted.
    pub encrypted_aem: [u8; AEM_LEN],
    /// Observation time, Unix seconds.
    pub timestamp: i64,
    /// Seconds the scan attributes to this observation.
    pub scan_interval: u16,
    /// Observed RSSI in dBm; `127` means the reading saturated.
    pub rssi: i8,
    /// Whether the radio flagged the reading as saturated.
    pub saturated: bool,
    /// How many raw reports were folded into this row.
    pub counter: u8,
}

impl Advertisement {
    /// Folds `other` into `self`.
    ///
    /// Counters add (saturating at `u8::MAX`). RSSI combines as the
    /// count-weighted mean when both readings carry magnitude; if either
    /// side saturated, the smaller reading wins since the saturated one
    /// carries no information.
    pub fn combine(&mut self, other: &Self) {
        let count_a = u32::from(self.counter);
        let count_b = u32::from(other.counter);
        if self.rssi == RSSI_SATURATED || other.rssi == RSSI_SATURATED {
            self.rssi = self.rssi.min(other.rssi);
        } else {
            let total = i64::from(self.rssi) * i64::from(count_a)
                + i64::from(other.rssi) * i64::from(count_b);
            #[allow(clippy::cast_possible_truncation)]
            {
                self.rssi = (total / i64::from(count_a + count_b)) as i8;
            }
        }
        self.saturated = self.rssi == RSSI_SATURATED;
        self.counter = u8::try_from(count_a + count_b).unwrap_or(u8::MAX);
    }
}

/// An advertisement returned from the store, annotated with the buffer
/// position that matched it.
#[derive(Debug, Clone)]
pub struct MatchedAdvertisement {
    /// The stored advertisement row.
    pub advertisement: Advertisement,
    /// Index of the matching TEK within the queried batch, or
    /// [`INVALID_DAILY_KEY_INDEX`] once the pipeline rejects the row.
    pub daily_key_index: u32,
    /// Slot within the TEK's rolling window (0..=143).
    pub rpi_index: u16,
}

impl MatchedAdvertisement {
    /// Whether the pipeline still considers this match valid.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.daily_key_index != INVALID_DAILY_KEY_INDEX
    }
}

/// Per-TEK exposure record produced by a query session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureInfo {
    /// UTC day of the earliest observation in the exposure.
    pub date: DateTime<Utc>,
    /// Duration-weighted attenuation across the fine bucket grid.
    pub attenuation_value: u8,
    /// Transmission risk level inherited from the matched TEK.
    pub transmission_risk_level: u8,
    /// Total exposure seconds, including saturated observations.
    pub duration: u16,
    /// Seconds per coarse attenuation bucket.
    pub attenuation_durations: [u16; 4],
    /// Risk score clamped to the 8-bit API range; filled at summary time.
    pub total_risk_score: u8,
    /// Unclamped risk score; filled at summary time.
    pub total_risk_score_full_range: f64,
}

/// Aggregate result of a detection session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureSummary {
    /// Summed seconds per coarse attenuation bucket, minute-rounded and
    /// capped at 30 minutes each.
    pub attenuation_durations: [u32; 3],
    /// Days between the most recent admitted exposure and now.
    pub days_since_last_exposure: i64,
    /// Number of TEKs that produced at least one match.
    pub matched_key_count: u64,
    /// Highest clamped risk score among admitted exposures.
    pub maximum_risk_score: u8,
    /// Highest unclamped risk score among admitted exposures.
    pub maximum_risk_score_full_range: f64,
    /// Sum of unclamped risk scores across admitted exposures.
    pub risk_score_sum_full_range: f64,
}
