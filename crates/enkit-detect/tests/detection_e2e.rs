//! End-to-end detection flow: seed an on-disk store with observed
//! advertisements, write a TEK export file, run a detection session
//! with a pre-filter, and check the emitted summary and records.

use std::sync::Arc;

use enkit_core::config::ExposureConfiguration;
use enkit_core::crypto::{encrypt_aem, rpi_for};
use enkit_core::export::{ExportMetadata, ExportReader, ExportWriter};
use enkit_core::types::{enin_from_unix, Advertisement, TemporaryExposureKey};
use enkit_detect::detect::DetectionSession;
use enkit_detect::store::AdvertisementStore;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;

fn diagnosis_key(byte: u8) -> TemporaryExposureKey {
    TemporaryExposureKey {
        key_data: [byte; 16],
        rolling_start_number: u32::try_from(enin_from_unix(NOW)).unwrap() - 120,
        rolling_period: Some(144),
        transmission_risk_level: 4,
    }
}

/// Persists an observation of `key`'s RPI slot at its nominal time.
fn observe(store: &AdvertisementStore, key: &TemporaryExposureKey, slot: u32, rssi: i8) {
    let interval = key.rolling_start_number + slot;
    let rpi = rpi_for(&key.key_data, interval).unwrap();
    // Version 0x40, tx power 12 dBm.
    let encrypted_aem = encrypt_aem(&[0x40, 0x0C, 0, 0], &key.key_data, &rpi).unwrap();
    store
        .insert(&Advertisement {
            rpi,
            encrypted_aem,
            timestamp: i64::from(interval) * 600,
            scan_interval: 4,
            rssi,
            saturated: false,
            counter: 1,
        })
        .unwrap();
}

fn scoring_config() -> ExposureConfiguration {
    let config: ExposureConfiguration = serde_json::from_str(
        r#"{
            "attenuation_level_values": [1, 2, 3, 4, 5, 6, 7, 8],
            "days_since_last_exposure_level_values": [1, 2, 3, 4, 5, 6, 7, 8],
            "duration_level_values": [1, 2, 3, 4, 5, 6, 7, 8],
            "transmission_risk_level_values": [1, 2, 3, 4, 5, 6, 7, 8],
            "minimum_risk_score": 10
        }"#,
    )
    .unwrap();
    config.validate().unwrap();
    config
}

#[test]
fn detection_session_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(AdvertisementStore::open(dir.path().join("en")).unwrap());

    // One diagnosed key observed twice (adjacent RPI slots), one key
    // never observed.
    let matched_key = diagnosis_key(1);
    observe(&store, &matched_key, 100, -50);
    observe(&store, &matched_key, 101, -50);
    let absent_key = diagnosis_key(2);
    assert_eq!(store.stored_count().unwrap(), 2);

    // Write the export file the way a key server would.
    let mut writer = ExportWriter::new(&ExportMetadata {
        start_timestamp: Some(1_699_900_000),
        end_timestamp: Some(1_700_000_000),
        region: Some("DE".to_string()),
        batch_number: Some(1),
        batch_size: Some(1),
        ..ExportMetadata::default()
    });
    writer.write_key(&matched_key);
    writer.write_key(&absent_key);
    let export = writer.finish();

    let mut session = DetectionSession::new(Arc::clone(&store), scoring_config())
        .unwrap()
        .with_prefilter(256 * 1024, 4)
        .unwrap();

    let mut reader = ExportReader::from_bytes(export).unwrap();
    assert_eq!(reader.metadata().region.as_deref(), Some("DE"));
    let matched = session.process_export(&mut reader, NOW).unwrap();
    assert_eq!(matched, 1);

    // The pre-filter admitted the two stored RPIs and culled nearly all
    // of the other 286 candidates.
    let possible = session.query_session().possible_rpi_count();
    assert!((2..32).contains(&possible), "possible_rpi_count = {possible}");

    // Both observations carry attenuation 62 (tx 12, rssi -50): fine
    // bucket 5 reads level 3, so the weighted attenuation value is 3.
    // Risk: 3 (attenuation) x 8 (same-day) x 2 (8 seconds) x 5
    // (transmission risk 4) = 240.
    let summary = session.generate_summary(NOW);
    assert_eq!(summary.matched_key_count, 1);
    assert_eq!(summary.days_since_last_exposure, 0);
    assert_eq!(summary.maximum_risk_score, 240);
    assert!((summary.maximum_risk_score_full_range - 240.0).abs() < f64::EPSILON);
    assert!((summary.risk_score_sum_full_range - 240.0).abs() < f64::EPSILON);
    // 8 seconds in the second coarse bucket, reported as one minute.
    assert_eq!(summary.attenuation_durations, [0, 60, 0]);

    let records = session.exposure_info(NOW);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.attenuation_value, 3);
    assert_eq!(record.transmission_risk_level, 4);
    assert_eq!(record.duration, 60);
    assert_eq!(record.attenuation_durations, [0, 60, 0, 0]);
    assert_eq!(record.total_risk_score, 240);
    assert_eq!(record.date.timestamp() % 86_400, 0);

    // Processing the same export again accumulates a second set of
    // cached records against the same store snapshot.
    let mut reader = ExportReader::from_bytes({
        let mut writer = ExportWriter::new(&ExportMetadata::default());
        writer.write_key(&diagnosis_key(1));
        writer.finish()
    })
    .unwrap();
    session.process_export(&mut reader, NOW).unwrap();
    assert_eq!(session.matched_key_count(), 2);
    assert_eq!(session.query_session().cached_exposure_info_count(), 2);
}

#[test]
fn retention_purge_shrinks_the_store() {
    let dir = TempDir::new().unwrap();
    let store = AdvertisementStore::open(dir.path().join("en")).unwrap();
    let key = diagnosis_key(3);
    observe(&store, &key, 0, -50);
    observe(&store, &key, 140, -50);

    let cutoff = i64::from(key.rolling_start_number + 100) * 600;
    assert_eq!(store.purge_before(cutoff).unwrap(), 1);
    assert_eq!(store.stored_count().unwrap(), 1);
}
