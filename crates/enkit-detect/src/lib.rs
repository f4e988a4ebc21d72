//! # enkit-detect
//!
//! The stateful half of the Exposure Notification detection core: a
//! persistent `SQLite` store of observed BLE advertisements, the query
//! session that joins diagnosis-key RPIs against it, and the detection
//! session that ingests TEK export files and emits exposure summaries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use enkit_core::config::ExposureConfiguration;
//! use enkit_core::export::ExportReader;
//! use enkit_detect::detect::DetectionSession;
//! use enkit_detect::store::AdvertisementStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(AdvertisementStore::open("/var/db/en")?);
//! let mut session = DetectionSession::new(store, ExposureConfiguration::default())?
//!     .with_prefilter(256 * 1024, 4)?;
//!
//! let now = chrono::Utc::now().timestamp();
//! let mut reader = ExportReader::open("export.bin")?;
//! session.process_export(&mut reader, now)?;
//! let summary = session.generate_summary(now);
//! println!("matched {} keys", summary.matched_key_count);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod detect;
pub mod session;
pub mod store;

pub use detect::{DetectionError, DetectionSession};
pub use session::{QuerySession, SessionError};
pub use store::{AdvertisementStore, StoreError};
