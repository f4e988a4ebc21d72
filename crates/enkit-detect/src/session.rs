//! Query session: TEK expansion, store matching, and exposure-record
//! construction.
//!
//! A session turns a batch of diagnosis keys into exposure records in
//! five passes:
//!
//! 1. **Expansion**: dedup the TEKs, derive all 144 RPIs per key into
//!    one packed buffer, and mark each slot valid if the session's
//!    pre-filter admits it (or unconditionally without a filter).
//! 2. **Matching**: hand the buffer to the store's join and get back
//!    advertisement rows annotated with their buffer position.
//! 3. **Validation**: reject rows that are too old, whose observation
//!    time is inconsistent with the interval the RPI encodes (±2 hours),
//!    or whose attenuation crosses the session threshold. Rejected rows
//!    keep their slot but carry the invalid sentinel.
//! 4. **Merging**: within each TEK's run of matches, fold observations
//!    within 4 seconds of the previous kept one, clamp overlapping scan
//!    intervals, and police each RPI's 20-minute broadcast window.
//! 5. **Bucketing**: split duration across the coarse attenuation grid,
//!    weight the fine grid into a single attenuation value, and emit one
//!    exposure record per TEK.
//!
//! Records can be cached in a bounded buffer for later enumeration by
//! the detection session; overflow beyond the cache capacity is silent
//! by design.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use enkit_core::config::{ConfigError, ExposureConfiguration, ATTENUATION_BUCKET_COUNT};
use enkit_core::crypto::{self, RPI_LEN, RSSI_SATURATED, TEK_ROLLING_PERIOD};
use enkit_core::filter::QueryFilter;
use enkit_core::types::{
    enin_from_unix, floor_to_utc_day, Advertisement, ExposureInfo, MatchedAdvertisement,
    TemporaryExposureKey, ADVERTISEMENT_RETENTION_SECS, INVALID_DAILY_KEY_INDEX,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{AdvertisementStore, StoreError};

/// Upper bound on the exposure cache, regardless of store size.
pub const EXPOSURE_CACHE_DEFAULT_CAPACITY: usize = 915_000;

/// Default batch size for cache enumeration.
pub const EXPOSURE_ENUMERATION_BATCH_SIZE: usize = 1024;

/// Observations this close to the previous kept one fold into it.
const MERGE_WINDOW_SECS: i64 = 4;

/// Nominal broadcast window of a single RPI.
const BROADCAST_WINDOW_SECS: i64 = 20 * 60;

/// Tolerated distance between observed and derived ENIN (±2 hours).
const CTIN_TOLERANCE: i64 = 12;

/// Plausible transmit power range for EN-capable radios.
const TX_POWER_RANGE: std::ops::RangeInclusive<i8> = -60..=20;

const SLOTS_PER_KEY: usize = TEK_ROLLING_PERIOD as usize;

/// Errors surfaced by the query pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The advertisement store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The exposure configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Bookkeeping failure inside the pipeline.
    #[error("internal session failure: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

/// A configured query session over one advertisement store.
pub struct QuerySession {
    store: Arc<AdvertisementStore>,
    filter: Option<QueryFilter>,
    attenuation_threshold: u8,
    config: ExposureConfiguration,
    cache_exposure_info: bool,
    cache_capacity: usize,
    cached: Vec<ExposureInfo>,
    possible_rpi_count: u64,
    dropped_advertisement_count: u64,
}

impl QuerySession {
    /// Creates a session with the given gating threshold and scoring
    /// configuration. The exposure cache is sized from the store's
    /// current row count, bounded by
    /// [`EXPOSURE_CACHE_DEFAULT_CAPACITY`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for an invalid configuration and
    /// store errors from the initial row count.
    pub fn new(
        store: Arc<AdvertisementStore>,
        attenuation_threshold: u8,
        config: ExposureConfiguration,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let stored = usize::try_from(store.stored_count()?).unwrap_or(usize::MAX);
        let cache_capacity = stored.min(EXPOSURE_CACHE_DEFAULT_CAPACITY);
        Ok(Self {
            store,
            filter: None,
            attenuation_threshold,
            config,
            cache_exposure_info: false,
            cache_capacity,
            cached: Vec::new(),
            possible_rpi_count: 0,
            dropped_advertisement_count: 0,
        })
    }

    /// Builds an inline pre-filter over the store's current contents and
    /// installs it for the rest of the session.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the filter build.
    pub fn with_prefilter(
        mut self,
        buffer_size: usize,
        hash_count: usize,
    ) -> Result<Self, SessionError> {
        self.filter = Some(self.store.build_prefilter(buffer_size, hash_count)?);
        Ok(self)
    }

    /// Enables or disables caching of produced exposure records.
    #[must_use]
    pub fn with_exposure_cache(mut self, enabled: bool) -> Self {
        self.cache_exposure_info = enabled;
        self
    }

    /// The session's default attenuation gating threshold.
    #[must_use]
    pub const fn attenuation_threshold(&self) -> u8 {
        self.attenuation_threshold
    }

    /// The session's scoring configuration.
    #[must_use]
    pub const fn config(&self) -> &ExposureConfiguration {
        &self.config
    }

    /// RPI slots that survived the pre-filter across all queries so far.
    #[must_use]
    pub const fn possible_rpi_count(&self) -> u64 {
        self.possible_rpi_count
    }

    /// Matched advertisements rejected by validation so far.
    #[must_use]
    pub const fn dropped_advertisement_count(&self) -> u64 {
        self.dropped_advertisement_count
    }

    /// Number of exposure records currently cached.
    #[must_use]
    pub fn cached_exposure_info_count(&self) -> usize {
        self.cached.len()
    }

    /// All cached exposure records, in production order.
    #[must_use]
    pub fn cached_exposure_info(&self) -> &[ExposureInfo] {
        &self.cached
    }

    /// Enumerates a sub-range of the cache in batches.
    pub fn cached_exposure_batches(
        &self,
        range: Range<usize>,
        batch_size: usize,
    ) -> impl Iterator<Item = &[ExposureInfo]> {
        let start = range.start.min(self.cached.len());
        let end = range.end.min(self.cached.len());
        self.cached[start..end].chunks(batch_size.max(1))
    }

    /// Runs the full pipeline for `keys` and returns how many distinct
    /// TEKs produced an exposure record.
    ///
    /// # Errors
    ///
    /// Store and internal failures; per-advertisement validation
    /// failures are counted, never returned.
    pub fn match_count(
        &mut self,
        keys: &[TemporaryExposureKey],
        attenuation_threshold: u8,
        now: i64,
    ) -> Result<u64, SessionError> {
        let records = self.run_query(keys, attenuation_threshold, now)?;
        Ok(records.len() as u64)
    }

    /// Runs the full pipeline for `keys` and returns the produced
    /// exposure records.
    ///
    /// # Errors
    ///
    /// As [`Self::match_count`].
    pub fn exposure_info_for_keys(
        &mut self,
        keys: &[TemporaryExposureKey],
        attenuation_threshold: u8,
        now: i64,
    ) -> Result<Vec<ExposureInfo>, SessionError> {
        self.run_query(keys, attenuation_threshold, now)
    }

    fn run_query(
        &mut self,
        keys: &[TemporaryExposureKey],
        attenuation_threshold: u8,
        now: i64,
    ) -> Result<Vec<ExposureInfo>, SessionError> {
        let unique = dedup_keys(keys);
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let (rpi_buffer, validity, valid_count) = self.expand_keys(&unique)?;
        self.possible_rpi_count += valid_count as u64;

        let mut matches = self.store.match_buffer(&rpi_buffer, &validity, valid_count)?;
        self.validate_matches(&unique, &mut matches, attenuation_threshold, now);

        let mut records = Vec::new();
        for (key_index, group) in valid_groups(&matches) {
            let key = unique[key_index];
            if let Some(record) = self.build_exposure(key, group) {
                records.push(record);
            }
        }
        debug!(
            keys = unique.len(),
            matches = matches.len(),
            records = records.len(),
            "query complete"
        );

        if self.cache_exposure_info {
            for record in &records {
                if self.cached.len() >= self.cache_capacity {
                    // Cache saturation is silent by contract.
                    break;
                }
                self.cached.push(record.clone());
            }
        }
        Ok(records)
    }

    /// Derives the packed RPI buffer and validity array for the deduped
    /// key batch.
    fn expand_keys(
        &self,
        keys: &[&TemporaryExposureKey],
    ) -> Result<(Vec<u8>, Vec<bool>, usize), SessionError> {
        let slot_count = keys.len() * SLOTS_PER_KEY;
        let mut rpi_buffer = vec![0u8; slot_count * RPI_LEN];
        let mut validity = vec![false; slot_count];

        for (key_index, key) in keys.iter().enumerate() {
            if key.exceeds_rolling_period() {
                warn!(
                    rolling_period = key.rolling_period,
                    "rejecting key with rolling period beyond one day"
                );
                continue;
            }
            let span =
                &mut rpi_buffer[key_index * SLOTS_PER_KEY * RPI_LEN..(key_index + 1) * SLOTS_PER_KEY * RPI_LEN];
            crypto::batch_rpi_into(&key.key_data, key.rolling_start_number, span).map_err(|e| {
                SessionError::Internal {
                    message: format!("rpi expansion failed: {e}"),
                }
            })?;

            let rolling_period = key.effective_rolling_period() as usize;
            for slot in 0..rolling_period {
                let rpi: [u8; RPI_LEN] = span[slot * RPI_LEN..(slot + 1) * RPI_LEN]
                    .try_into()
                    .map_err(|_| SessionError::Internal {
                        message: "rpi buffer misaligned".to_string(),
                    })?;
                validity[key_index * SLOTS_PER_KEY + slot] = match &self.filter {
                    Some(filter) => filter.maybe_present(&rpi),
                    None => true,
                };
            }
        }
        let valid_count = validity.iter().filter(|&&valid| valid).count();
        Ok((rpi_buffer, validity, valid_count))
    }

    /// Marks matches that fail age, interval-consistency, or threshold
    /// checks with the invalid sentinel.
    fn validate_matches(
        &mut self,
        keys: &[&TemporaryExposureKey],
        matches: &mut [MatchedAdvertisement],
        attenuation_threshold: u8,
        now: i64,
    ) {
        for matched in matches.iter_mut() {
            let key = keys[matched.daily_key_index as usize];
            let advertisement = &matched.advertisement;

            let expired = now - advertisement.timestamp >= ADVERTISEMENT_RETENTION_SECS;

            let derived_enin =
                i64::from(matched.rpi_index) + i64::from(key.rolling_start_number);
            let observed_enin = enin_from_unix(advertisement.timestamp);
            let interval_inconsistent = (observed_enin - derived_enin).abs() > CTIN_TOLERANCE;

            let attenuation = crypto::attenuation(
                &key.key_data,
                &advertisement.rpi,
                &advertisement.encrypted_aem,
                advertisement.rssi,
                advertisement.saturated,
            );
            let gated = attenuation >= attenuation_threshold;

            if expired || interval_inconsistent || gated {
                matched.daily_key_index = INVALID_DAILY_KEY_INDEX;
                self.dropped_advertisement_count += 1;
            }
        }
    }

    /// Merges, filters, buckets, and aggregates one TEK's surviving
    /// matches into an exposure record. Returns `None` when every
    /// observation is filtered away.
    fn build_exposure(
        &mut self,
        key: &TemporaryExposureKey,
        group: Vec<Advertisement>,
    ) -> Option<ExposureInfo> {
        let mut advertisements = group;
        advertisements.sort_by_key(|a| a.timestamp);

        // Fold observations within the merge window into the previous
        // kept advertisement.
        let mut merged: Vec<Advertisement> = Vec::with_capacity(advertisements.len());
        for advertisement in advertisements {
            match merged.last_mut() {
                Some(kept) if advertisement.timestamp - kept.timestamp <= MERGE_WINDOW_SECS => {
                    kept.combine(&advertisement);
                }
                _ => merged.push(advertisement),
            }
        }

        // Clamp scan intervals that would overlap the previous
        // observation.
        for i in 1..merged.len() {
            let previous_timestamp = merged[i - 1].timestamp;
            let current = &mut merged[i];
            if previous_timestamp > current.timestamp - i64::from(current.scan_interval) {
                current.scan_interval =
                    u16::try_from(current.timestamp - previous_timestamp).unwrap_or(0);
            }
        }

        // Validity filters: plausible transmit power, non-zero path
        // loss, and the per-RPI broadcast window.
        let mut first_seen: HashMap<[u8; RPI_LEN], i64> = HashMap::new();
        let mut surviving: Vec<(Advertisement, u8)> = Vec::with_capacity(merged.len());
        for advertisement in merged {
            let Ok(tx_power) = crypto::tx_power_from_aem(
                &advertisement.encrypted_aem,
                &key.key_data,
                &advertisement.rpi,
            ) else {
                self.dropped_advertisement_count += 1;
                continue;
            };
            if !TX_POWER_RANGE.contains(&tx_power) {
                self.dropped_advertisement_count += 1;
                continue;
            }

            let saturated = advertisement.rssi == RSSI_SATURATED;
            let attenuation =
                crypto::attenuation_for(tx_power, advertisement.rssi, advertisement.saturated);
            if !saturated && attenuation == 0 {
                // Zero path loss is not a plausible radio observation.
                self.dropped_advertisement_count += 1;
                continue;
            }

            let first = *first_seen
                .entry(advertisement.rpi)
                .or_insert(advertisement.timestamp);
            if advertisement.timestamp - first > BROADCAST_WINDOW_SECS {
                self.dropped_advertisement_count += 1;
                continue;
            }
            surviving.push((advertisement, attenuation));
        }
        if surviving.is_empty() {
            return None;
        }

        // Bucket durations on both grids; saturated observations count
        // toward the total only.
        let mut total_duration: u32 = 0;
        let mut coarse_durations = [0u32; ATTENUATION_BUCKET_COUNT];
        let mut fine_durations = [0u32; enkit_core::config::RISK_LEVEL_COUNT];
        let mut earliest = i64::MAX;
        for (advertisement, attenuation) in &surviving {
            earliest = earliest.min(advertisement.timestamp);
            let duration = u32::from(advertisement.scan_interval);
            total_duration = total_duration.saturating_add(duration);
            if advertisement.rssi == RSSI_SATURATED {
                continue;
            }
            coarse_durations[self.config.coarse_attenuation_bucket(*attenuation)] += duration;
            fine_durations[ExposureConfiguration::fine_attenuation_bucket(*attenuation)] +=
                duration;
        }

        let weighted_total: u32 = fine_durations.iter().sum();
        let attenuation_value = if weighted_total == 0 {
            0
        } else {
            let weighted_sum: f64 = fine_durations
                .iter()
                .enumerate()
                .map(|(bucket, &duration)| {
                    f64::from(duration) * self.config.attenuation_level_value_for_bucket(bucket)
                })
                .sum();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let weighted = (weighted_sum / f64::from(weighted_total))
                .round()
                .clamp(0.0, 255.0) as u8;
            weighted
        };

        let mut attenuation_durations = [0u16; ATTENUATION_BUCKET_COUNT];
        for (slot, duration) in attenuation_durations.iter_mut().zip(coarse_durations) {
            *slot = u16::try_from(duration).unwrap_or(u16::MAX);
        }

        Some(ExposureInfo {
            date: floor_to_utc_day(earliest),
            attenuation_value,
            transmission_risk_level: key.transmission_risk_level,
            duration: u16::try_from(total_duration).unwrap_or(u16::MAX),
            attenuation_durations,
            total_risk_score: 0,
            total_risk_score_full_range: 0.0,
        })
    }
}

impl std::fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("attenuation_threshold", &self.attenuation_threshold)
            .field("has_prefilter", &self.filter.is_some())
            .field("cache_exposure_info", &self.cache_exposure_info)
            .field("cached", &self.cached.len())
            .field("possible_rpi_count", &self.possible_rpi_count)
            .field(
                "dropped_advertisement_count",
                &self.dropped_advertisement_count,
            )
            .finish_non_exhaustive()
    }
}

/// Deduplicates a key batch by key bytes, first occurrence winning.
fn dedup_keys(keys: &[TemporaryExposureKey]) -> Vec<&TemporaryExposureKey> {
    let mut unique: Vec<&TemporaryExposureKey> = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.iter().any(|existing| existing.key_eq(key)) {
            unique.push(key);
        }
    }
    unique
}

/// Splits matches into per-TEK groups, skipping invalidated entries.
///
/// Matches arrive in ascending buffer order, so all of one TEK's rows
/// are contiguous; a change of `daily_key_index` among valid entries
/// starts a new group.
fn valid_groups(matches: &[MatchedAdvertisement]) -> Vec<(usize, Vec<Advertisement>)> {
    let mut groups: Vec<(usize, Vec<Advertisement>)> = Vec::new();
    for matched in matches {
        if !matched.is_valid() {
            continue;
        }
        let key_index = matched.daily_key_index as usize;
        match groups.last_mut() {
            Some((current, group)) if *current == key_index => {
                group.push(matched.advertisement.clone());
            }
            _ => groups.push((key_index, vec![matched.advertisement.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use enkit_core::crypto::{encrypt_aem, rpi_for};

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn test_key(byte: u8) -> TemporaryExposureKey {
        TemporaryExposureKey {
            key_data: [byte; 16],
            // Keys current as of "now": slot j covers NOW once
            // rolling_start_number = enin(NOW) - j for the slots used.
            rolling_start_number: u32::try_from(enin_from_unix(NOW)).unwrap() - 100,
            rolling_period: None,
            transmission_risk_level: 4,
        }
    }

    /// Stores an observation of `key`'s RPI slot `slot` with a valid AEM.
    fn seed_observation(
        store: &AdvertisementStore,
        key: &TemporaryExposureKey,
        slot: u32,
        timestamp: i64,
        rssi: i8,
        tx_power: i8,
    ) {
        let interval = key.rolling_start_number + slot;
        let rpi = rpi_for(&key.key_data, interval).unwrap();
        #[allow(clippy::cast_sign_loss)]
        let metadata = [0x40, tx_power as u8, 0, 0];
        let encrypted_aem = encrypt_aem(&metadata, &key.key_data, &rpi).unwrap();
        store
            .insert(&Advertisement {
                rpi,
                encrypted_aem,
                timestamp,
                scan_interval: 4,
                rssi,
                saturated: rssi == RSSI_SATURATED,
                counter: 1,
            })
            .unwrap();
    }

    /// Timestamp consistent with `key`'s slot `slot`.
    fn slot_timestamp(key: &TemporaryExposureKey, slot: u32) -> i64 {
        i64::from(key.rolling_start_number + slot) * 600
    }

    fn session(store: Arc<AdvertisementStore>) -> QuerySession {
        QuerySession::new(store, 0xFF, ExposureConfiguration::default()).unwrap()
    }

    #[test]
    fn test_single_observation_produces_one_record() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);

        let mut session = session(store);
        let records = session
            .exposure_info_for_keys(&[key.clone()], 0xFF, NOW)
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.transmission_risk_level, 4);
        assert_eq!(record.duration, 4);
        // Attenuation 62 falls in the second coarse bucket (51..=70).
        assert_eq!(record.attenuation_durations, [0, 4, 0, 0]);
        assert_eq!(session.dropped_advertisement_count(), 0);
    }

    #[test]
    fn test_match_count_counts_keys_not_rows() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        seed_observation(&store, &key, 100, ts, -50, 12);
        seed_observation(&store, &key, 100, ts + 120, -55, 12);
        let absent = test_key(2);

        let mut session = session(store);
        let count = session
            .match_count(&[key, absent], 0xFF, NOW)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_duplicate_keys_are_deduplicated() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);

        let mut session = session(store);
        let count = session
            .match_count(&[key.clone(), key.clone(), key], 0xFF, NOW)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_oversized_rolling_period_rejects_whole_key() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let mut key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);
        key.rolling_period = Some(200);

        let mut session = session(store);
        assert_eq!(session.match_count(&[key], 0xFF, NOW).unwrap(), 0);
        assert_eq!(session.possible_rpi_count(), 0);
    }

    #[test]
    fn test_truncated_rolling_period_limits_slots() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let mut key = test_key(1);
        key.rolling_period = Some(50);
        // Slot 100 lies past the truncated window.
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);
        seed_observation(&store, &key, 10, slot_timestamp(&key, 10), -50, 12);

        let mut session = session(store);
        let records = session
            .exposure_info_for_keys(&[key], 0xFF, NOW)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration, 4);
    }

    #[test]
    fn test_age_cutoff_boundary() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        // Anchor "now" so the boundary observation is interval-consistent.
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        let now = ts + ADVERTISEMENT_RETENTION_SECS;
        seed_observation(&store, &key, 100, ts, -50, 12);

        let mut session = session(Arc::clone(&store));
        // Exactly 14 days old: dropped.
        assert_eq!(session.match_count(&[key.clone()], 0xFF, now).unwrap(), 0);
        assert_eq!(session.dropped_advertisement_count(), 1);

        // One second younger: kept. CTIN tolerance is ±2h, so move the
        // observation rather than "now".
        let key2 = test_key(2);
        let ts2 = slot_timestamp(&key2, 100);
        seed_observation(&store, &key2, 100, ts2, -50, 12);
        let now2 = ts2 + ADVERTISEMENT_RETENTION_SECS - 1;
        assert_eq!(session.match_count(&[key2], 0xFF, now2).unwrap(), 1);
    }

    #[test]
    fn test_interval_consistency_boundary() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let base = slot_timestamp(&key, 100);

        // Observed 12 intervals after the slot's nominal time: kept.
        seed_observation(&store, &key, 100, base + CTIN_TOLERANCE * 600, -50, 12);
        let mut session = session(Arc::clone(&store));
        assert_eq!(
            session.match_count(&[key.clone()], 0xFF, NOW).unwrap(),
            1
        );

        // 13 intervals away: dropped.
        let key2 = test_key(2);
        let base2 = slot_timestamp(&key2, 100);
        seed_observation(&store, &key2, 100, base2 + (CTIN_TOLERANCE + 1) * 600, -50, 12);
        let before = session.dropped_advertisement_count();
        assert_eq!(session.match_count(&[key2], 0xFF, NOW).unwrap(), 0);
        assert_eq!(session.dropped_advertisement_count(), before + 1);
    }

    #[test]
    fn test_attenuation_threshold_gates_matches() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        // tx 12, rssi -50: attenuation 62.
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);

        let mut session = session(store);
        assert_eq!(session.match_count(&[key.clone()], 62, NOW).unwrap(), 0);
        assert_eq!(session.match_count(&[key], 63, NOW).unwrap(), 1);
    }

    #[test]
    fn test_merge_within_window() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        seed_observation(&store, &key, 100, ts, -60, 12);
        seed_observation(&store, &key, 100, ts + 3, -70, 12);

        let mut session = session(store);
        let records = session
            .exposure_info_for_keys(&[key], 0xFF, NOW)
            .unwrap();
        assert_eq!(records.len(), 1);
        // Two observations folded into one: one scan interval of
        // duration. The weighted rssi of -65 puts attenuation at 77,
        // the third coarse bucket.
        assert_eq!(records[0].duration, 4);
        assert_eq!(records[0].attenuation_durations, [0, 0, 4, 0]);
    }

    #[test]
    fn test_broadcast_window_drops_late_observation() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        seed_observation(&store, &key, 100, ts, -50, 12);
        seed_observation(&store, &key, 100, ts + 600, -50, 12);
        seed_observation(&store, &key, 100, ts + 1_300, -50, 12);

        let mut session = session(store);
        let records = session
            .exposure_info_for_keys(&[key], 0xFF, NOW)
            .unwrap();
        assert_eq!(records.len(), 1);
        // Third observation exceeded the 1200-second window.
        assert_eq!(records[0].duration, 8);
        assert_eq!(session.dropped_advertisement_count(), 1);
    }

    #[test]
    fn test_implausible_tx_power_is_dropped() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, -80);

        let mut session = session(store);
        assert_eq!(session.match_count(&[key], 0xFF, NOW).unwrap(), 0);
        assert_eq!(session.dropped_advertisement_count(), 1);
    }

    #[test]
    fn test_saturated_counts_toward_total_only() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        seed_observation(&store, &key, 100, ts, -50, 12);
        seed_observation(&store, &key, 100, ts + 60, RSSI_SATURATED, 12);

        let mut session = session(store);
        let records = session
            .exposure_info_for_keys(&[key], 0xFF, NOW)
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.duration, 8);
        let bucketed: u32 = record
            .attenuation_durations
            .iter()
            .map(|&d| u32::from(d))
            .sum();
        // Duration conservation: buckets never exceed the total.
        assert_eq!(bucketed, 4);
        assert!(bucketed <= u32::from(record.duration));
    }

    #[test]
    fn test_prefilter_culls_expansion() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);

        let mut session = QuerySession::new(
            Arc::clone(&store),
            0xFF,
            ExposureConfiguration::default(),
        )
        .unwrap()
        .with_prefilter(64 * 1024, 4)
        .unwrap();

        let count = session.match_count(&[key], 0xFF, NOW).unwrap();
        assert_eq!(count, 1);
        // The filter admits the stored slot and rejects nearly all of
        // the other 143.
        assert!(session.possible_rpi_count() >= 1);
        assert!(session.possible_rpi_count() < 16);
    }

    #[test]
    fn test_exposure_cache_batched_enumeration() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let keys: Vec<TemporaryExposureKey> = (1..=5u8).map(test_key).collect();
        for key in &keys {
            seed_observation(store.as_ref(), key, 100, slot_timestamp(key, 100), -50, 12);
        }

        let mut session = QuerySession::new(
            Arc::clone(&store),
            0xFF,
            ExposureConfiguration::default(),
        )
        .unwrap()
        .with_exposure_cache(true);

        session.match_count(&keys, 0xFF, NOW).unwrap();
        assert_eq!(session.cached_exposure_info_count(), 5);

        let batches: Vec<&[ExposureInfo]> =
            session.cached_exposure_batches(0..5, 2).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);

        let sub: Vec<&[ExposureInfo]> =
            session.cached_exposure_batches(1..3, EXPOSURE_ENUMERATION_BATCH_SIZE).collect();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].len(), 2);
    }

    #[test]
    fn test_cache_capacity_is_bounded_by_store_size() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        seed_observation(&store, &key, 100, slot_timestamp(&key, 100), -50, 12);
        // One stored row: capacity 1. A second record is dropped
        // silently.
        let mut session = QuerySession::new(
            Arc::clone(&store),
            0xFF,
            ExposureConfiguration::default(),
        )
        .unwrap()
        .with_exposure_cache(true);

        let key2 = test_key(2);
        seed_observation(&store, &key2, 100, slot_timestamp(&key2, 100), -50, 12);
        session.match_count(&[key, key2], 0xFF, NOW).unwrap();
        assert_eq!(session.cached_exposure_info_count(), 1);
    }

    #[test]
    fn test_merge_idempotence() {
        let store = Arc::new(AdvertisementStore::open_in_memory().unwrap());
        let key = test_key(1);
        let ts = slot_timestamp(&key, 100);
        for offset in [0i64, 30, 60] {
            seed_observation(&store, &key, 100, ts + offset, -50, 12);
        }

        let mut session = session(Arc::clone(&store));
        let first = session
            .exposure_info_for_keys(&[key.clone()], 0xFF, NOW)
            .unwrap();
        let second = session
            .exposure_info_for_keys(&[key], 0xFF, NOW)
            .unwrap();
        assert_eq!(first[0].duration, second[0].duration);
        assert_eq!(
            first[0].attenuation_durations,
            second[0].attenuation_durations
        );
    }
}
