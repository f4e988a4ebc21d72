//! # enkit-core
//!
//! Building blocks for on-device Exposure Notification detection.
//!
//! This crate holds everything below the storage layer: the TEK key
//! schedule and AEM cryptography, the bloom pre-filter used to cull
//! store lookups, the export/signature file formats, the shared data
//! model, and the risk-scoring configuration. The stateful pieces (the
//! persistent advertisement store and the detection sessions) live in
//! `enkit-detect`.
//!
//! ## Example
//!
//! ```rust
//! use enkit_core::crypto::{batch_rpi, generate_tek};
//!
//! let tek = generate_tek();
//! let rpis = batch_rpi(&tek, 2_649_600)?;
//! assert_eq!(rpis.len(), 144 * 16);
//! # Ok::<(), enkit_core::crypto::CryptoError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod crypto;
pub mod export;
pub mod filter;
pub mod types;
pub mod wire;

pub use config::ExposureConfiguration;
pub use export::{ExportMetadata, ExportReader, ExportWriter, SignatureFile, SignatureVerifier};
pub use filter::QueryFilter;
pub use types::{
    Advertisement, ExposureInfo, ExposureSummary, MatchedAdvertisement, TemporaryExposureKey,
};
