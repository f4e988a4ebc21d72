//! Detection session: batched export ingestion and summary emission.
//!
//! A detection session wraps a query session configured for full-range
//! matching (threshold `0xFF`, exposure caching on) and feeds it TEK
//! export files in batches of 256 keys. Once every file of an export has
//! been processed, [`DetectionSession::generate_summary`] scores the
//! cached exposure records and folds the admitted ones into an
//! [`ExposureSummary`]; [`DetectionSession::exposure_info`] emits the
//! admitted records themselves with their durations rounded for the
//! client surface.
//!
//! A file error stops processing of that file and surfaces immediately;
//! the session and its cache stay valid for further files.

use std::sync::Arc;

use enkit_core::config::ExposureConfiguration;
use enkit_core::export::{ExportError, ExportReader};
use enkit_core::types::{
    round_reported_duration, ExposureInfo, ExposureSummary, SECONDS_PER_DAY,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::{QuerySession, SessionError};
use crate::store::AdvertisementStore;

/// Keys read from an export file per query batch.
const TEK_FILE_BATCH_SIZE: usize = 256;

/// Detection queries never gate on attenuation; scoring happens later.
const QUERY_ATTENUATION_THRESHOLD: u8 = 0xFF;

/// Errors surfaced while processing an export through a detection
/// session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DetectionError {
    /// The export file failed to parse.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The query pipeline failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A detection session accumulating matches across export files.
#[derive(Debug)]
pub struct DetectionSession {
    query: QuerySession,
    matched_key_count: u64,
}

impl DetectionSession {
    /// Creates a detection session over `store` with the given scoring
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for an invalid configuration or a store
    /// failure.
    pub fn new(
        store: Arc<AdvertisementStore>,
        config: ExposureConfiguration,
    ) -> Result<Self, SessionError> {
        let query = QuerySession::new(store, QUERY_ATTENUATION_THRESHOLD, config)?
            .with_exposure_cache(true);
        Ok(Self {
            query,
            matched_key_count: 0,
        })
    }

    /// Installs an inline pre-filter for the rest of the session.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the filter build.
    pub fn with_prefilter(
        mut self,
        buffer_size: usize,
        hash_count: usize,
    ) -> Result<Self, SessionError> {
        self.query = self.query.with_prefilter(buffer_size, hash_count)?;
        Ok(self)
    }

    /// TEKs that produced at least one exposure record so far.
    #[must_use]
    pub const fn matched_key_count(&self) -> u64 {
        self.matched_key_count
    }

    /// The underlying query session, for statistics.
    #[must_use]
    pub const fn query_session(&self) -> &QuerySession {
        &self.query
    }

    /// Processes one export file: reads keys in batches, matches each
    /// batch, and caches the produced exposure records.
    ///
    /// Returns the number of keys from this file that matched. The first
    /// error aborts the current file but leaves the session valid.
    ///
    /// # Errors
    ///
    /// [`DetectionError::Export`] for file errors,
    /// [`DetectionError::Session`] for pipeline errors.
    pub fn process_export(
        &mut self,
        reader: &mut ExportReader,
        now: i64,
    ) -> Result<u64, DetectionError> {
        let mut matched = 0u64;
        loop {
            let batch = reader.read_batch(TEK_FILE_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            matched += self
                .query
                .match_count(&batch, QUERY_ATTENUATION_THRESHOLD, now)?;
        }
        self.matched_key_count += matched;
        info!(
            matched,
            total = self.matched_key_count,
            region = reader.metadata().region.as_deref().unwrap_or(""),
            "processed key export file"
        );
        Ok(matched)
    }

    fn admitted_records(&self, now: i64) -> impl Iterator<Item = (ExposureInfo, i64)> + '_ {
        self.query.cached_exposure_info().iter().filter_map(move |record| {
            let days_since = (now - record.date.timestamp()).div_euclid(SECONDS_PER_DAY);
            let (full_range, clamped) = self.query.config().risk_score(record, days_since);
            if !self.query.config().admits(full_range, clamped) {
                return None;
            }
            let mut scored = record.clone();
            scored.total_risk_score = clamped;
            scored.total_risk_score_full_range = full_range;
            Some((scored, days_since))
        })
    }

    /// Scores the cached exposure records and aggregates the admitted
    /// ones into a summary.
    #[must_use]
    pub fn generate_summary(&self, now: i64) -> ExposureSummary {
        let mut summary = ExposureSummary {
            matched_key_count: self.matched_key_count,
            ..ExposureSummary::default()
        };
        let mut bucket_sums = [0u32; 3];
        let mut most_recent_days: Option<i64> = None;

        for (record, days_since) in self.admitted_records(now) {
            for (sum, &duration) in bucket_sums.iter_mut().zip(&record.attenuation_durations) {
                *sum = sum.saturating_add(u32::from(duration));
            }
            most_recent_days = Some(most_recent_days.map_or(days_since, |d| d.min(days_since)));
            summary.maximum_risk_score = summary.maximum_risk_score.max(record.total_risk_score);
            summary.maximum_risk_score_full_range = summary
                .maximum_risk_score_full_range
                .max(record.total_risk_score_full_range);
            summary.risk_score_sum_full_range += record.total_risk_score_full_range;
        }

        for (slot, sum) in summary.attenuation_durations.iter_mut().zip(bucket_sums) {
            *slot = round_reported_duration(sum);
        }
        summary.days_since_last_exposure = most_recent_days.unwrap_or(0);
        debug!(
            admitted_max = summary.maximum_risk_score,
            matched_keys = summary.matched_key_count,
            "generated exposure summary"
        );
        summary
    }

    /// Emits the admitted exposure records with their durations rounded
    /// up to minute granularity and capped at 30 minutes.
    #[must_use]
    pub fn exposure_info(&self, now: i64) -> Vec<ExposureInfo> {
        self.admitted_records(now)
            .map(|(mut record, _)| {
                record.duration =
                    u16::try_from(round_reported_duration(u32::from(record.duration)))
                        .unwrap_or(u16::MAX);
                for duration in &mut record.attenuation_durations {
                    *duration =
                        u16::try_from(round_reported_duration(u32::from(*duration)))
                            .unwrap_or(u16::MAX);
                }
                record
            })
            .collect()
    }
}
