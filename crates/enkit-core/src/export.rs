//! TEK export and signature file handling.
//!
//! An export file is a 16-byte identifier (`"EK Export v1    "`) followed
//! by a protobuf record stream: file-level metadata fields interleaved
//! with `Key` sub-messages (tag 7). The reader hashes the complete file
//! on open so a batch signature can be verified later, collects metadata
//! in a position-buffered pass so metadata may appear anywhere in the
//! stream, and then iterates keys lazily.
//!
//! Signature files are a plain protobuf message listing one signature
//! record per batch file. Parsing lives here; the cryptographic
//! verification itself is an external concern behind
//! [`SignatureVerifier`].

use std::path::Path;

use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::crypto::TEK_LEN;
use crate::types::TemporaryExposureKey;
use crate::wire::{StreamReader, StreamWriter, WireError, WireType};

/// Identifier that opens every TEK export file.
pub const EXPORT_IDENTIFIER: &[u8; 16] = b"EK Export v1    ";

const TAG_START_TIMESTAMP: u32 = 1;
const TAG_END_TIMESTAMP: u32 = 2;
const TAG_REGION: u32 = 3;
const TAG_BATCH_NUMBER: u32 = 4;
const TAG_BATCH_SIZE: u32 = 5;
const TAG_SIGNATURE_INFO: u32 = 6;
const TAG_KEY: u32 = 7;

mod proto {
    //! Prost types for the length-delimited sub-messages.

    /// `Key` sub-message of an export file.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyRecord {
        /// The 16 TEK bytes.
        #[prost(bytes = "vec", tag = "1")]
        pub key_data: ::prost::alloc::vec::Vec<u8>,
        /// Transmission risk assigned by the health authority.
        #[prost(uint32, optional, tag = "2")]
        pub transmission_risk_level: ::core::option::Option<u32>,
        /// ENIN at which the key became current.
        #[prost(uint32, optional, tag = "3")]
        pub rolling_start_interval_number: ::core::option::Option<u32>,
        /// Number of 10-minute intervals the key covers.
        #[prost(uint32, optional, tag = "4")]
        pub rolling_period: ::core::option::Option<u32>,
    }

    /// Identity of the signer of a batch.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SignatureInfo {
        /// iOS app bundle id the batch is scoped to.
        #[prost(string, optional, tag = "1")]
        pub apple_bundle_id: ::core::option::Option<::prost::alloc::string::String>,
        /// Android package the batch is scoped to.
        #[prost(string, optional, tag = "2")]
        pub android_package: ::core::option::Option<::prost::alloc::string::String>,
        /// Version of the verification key.
        #[prost(string, optional, tag = "3")]
        pub verification_key_version: ::core::option::Option<::prost::alloc::string::String>,
        /// Identifier of the verification key.
        #[prost(string, optional, tag = "4")]
        pub verification_key_id: ::core::option::Option<::prost::alloc::string::String>,
        /// Signature algorithm name.
        #[prost(string, optional, tag = "5")]
        pub signature_algorithm: ::core::option::Option<::prost::alloc::string::String>,
    }

    /// One signature over one batch file.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TekSignature {
        /// Signer identity.
        #[prost(message, optional, tag = "1")]
        pub signature_info: ::core::option::Option<SignatureInfo>,
        /// Batch number (the 2 in "2 of 10").
        #[prost(uint32, optional, tag = "2")]
        pub batch_num: ::core::option::Option<u32>,
        /// Total batches in the export.
        #[prost(uint32, optional, tag = "3")]
        pub batch_size: ::core::option::Option<u32>,
        /// X9.62-encoded signature bytes.
        #[prost(bytes = "vec", optional, tag = "4")]
        pub signature: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    /// Top-level message of a signature file.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TekSignatureList {
        /// All signatures carried by the file.
        #[prost(message, repeated, tag = "1")]
        pub signatures: ::prost::alloc::vec::Vec<TekSignature>,
    }
}

/// Errors produced by export and signature file handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    /// Reading the file from disk failed.
    #[error("export file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not conform to the export format.
    #[error("bad export format: {reason}")]
    BadFormat {
        /// What failed to parse.
        reason: String,
    },

    /// The record stream was malformed at the framing layer.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A batch signature failed verification.
    #[error("signature rejected: {reason}")]
    SignatureInvalid {
        /// Why the signature was rejected.
        reason: String,
    },
}

impl From<prost::DecodeError> for ExportError {
    fn from(err: prost::DecodeError) -> Self {
        Self::BadFormat {
            reason: format!("sub-message decode failed: {err}"),
        }
    }
}

/// Signer identity attached to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureInfo {
    /// iOS app bundle id the batch is scoped to.
    pub apple_bundle_id: Option<String>,
    /// Android package the batch is scoped to.
    pub android_package: Option<String>,
    /// Version of the verification key.
    pub verification_key_version: Option<String>,
    /// Identifier of the verification key.
    pub verification_key_id: Option<String>,
    /// Signature algorithm name, e.g. ECDSA P-256 with SHA-256.
    pub signature_algorithm: Option<String>,
}

impl From<proto::SignatureInfo> for SignatureInfo {
    fn from(p: proto::SignatureInfo) -> Self {
        Self {
            apple_bundle_id: p.apple_bundle_id,
            android_package: p.android_package,
            verification_key_version: p.verification_key_version,
            verification_key_id: p.verification_key_id,
            signature_algorithm: p.signature_algorithm,
        }
    }
}

/// File-level metadata collected from an export file.
#[derive(Debug, Clone, Default)]
pub struct ExportMetadata {
    /// Earliest key window covered, Unix seconds.
    pub start_timestamp: Option<u64>,
    /// Latest key window covered, Unix seconds.
    pub end_timestamp: Option<u64>,
    /// Region (country) the keys came from.
    pub region: Option<String>,
    /// Batch number within the export.
    pub batch_number: Option<u32>,
    /// Total batches in the export.
    pub batch_size: Option<u32>,
    /// Signer identities announced by the file.
    pub signature_infos: Vec<SignatureInfo>,
}

/// Reads a TEK export file: metadata eagerly, keys lazily.
pub struct ExportReader {
    data: Vec<u8>,
    sha256: [u8; 32],
    metadata: ExportMetadata,
    cursor: usize,
}

// Key material stays out of Debug output.
impl std::fmt::Debug for ExportReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportReader")
            .field("len", &self.data.len())
            .field("sha256", &hex::encode(self.sha256))
            .field("metadata", &self.metadata)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl ExportReader {
    /// Opens an export held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::BadFormat`] on an identifier mismatch and
    /// framing errors if the metadata pass hits a malformed stream.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ExportError> {
        if data.len() < EXPORT_IDENTIFIER.len()
            || data[..EXPORT_IDENTIFIER.len()] != EXPORT_IDENTIFIER[..]
        {
            return Err(ExportError::BadFormat {
                reason: "missing EK Export v1 identifier".to_string(),
            });
        }
        let sha256 = Sha256::digest(&data).into();

        // Metadata pass: walk the whole stream, remember where keys
        // start, and come back to it for iteration.
        let mut reader = StreamReader::new(&data);
        reader.set_position(EXPORT_IDENTIFIER.len())?;
        let keys_start = reader.position();
        let metadata = Self::collect_metadata(&mut reader)?;

        Ok(Self {
            data,
            sha256,
            metadata,
            cursor: keys_start,
        })
    }

    /// Opens an export file from disk.
    ///
    /// # Errors
    ///
    /// As [`Self::from_bytes`], plus I/O errors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    fn collect_metadata(reader: &mut StreamReader<'_>) -> Result<ExportMetadata, ExportError> {
        let restore = reader.position();
        let mut metadata = ExportMetadata::default();
        while let Some((tag, wire_type)) = reader.read_field()? {
            match (tag, wire_type) {
                (TAG_START_TIMESTAMP, WireType::Fixed64) => {
                    metadata.start_timestamp = Some(reader.read_fixed64()?);
                }
                (TAG_END_TIMESTAMP, WireType::Fixed64) => {
                    metadata.end_timestamp = Some(reader.read_fixed64()?);
                }
                (TAG_REGION, WireType::LengthDelimited) => {
                    metadata.region = Some(reader.read_string()?.to_string());
                }
                (TAG_BATCH_NUMBER, WireType::Varint) => {
                    metadata.batch_number = Some(reader.read_varint_u32()?);
                }
                (TAG_BATCH_SIZE, WireType::Varint) => {
                    metadata.batch_size = Some(reader.read_varint_u32()?);
                }
                (TAG_SIGNATURE_INFO, WireType::LengthDelimited) => {
                    let bytes = reader.read_length_delimited()?;
                    metadata
                        .signature_infos
                        .push(proto::SignatureInfo::decode(bytes)?.into());
                }
                (_, wire_type) => reader.skip(wire_type)?,
            }
        }
        reader.set_position(restore)?;
        Ok(metadata)
    }

    /// SHA-256 of the complete file, for batch signature verification.
    #[must_use]
    pub const fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    /// Metadata collected when the file was opened.
    #[must_use]
    pub const fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    /// Reads the next key record, or `None` at a clean end of file.
    ///
    /// # Errors
    ///
    /// Framing errors surface as [`ExportError::Wire`]; a key record
    /// whose `KeyData` is not 16 bytes is [`ExportError::BadFormat`].
    pub fn next_key(&mut self) -> Result<Option<TemporaryExposureKey>, ExportError> {
        let mut reader = StreamReader::new(&self.data);
        reader.set_position(self.cursor)?;

        let result = loop {
            match reader.read_field()? {
                None => break Ok(None),
                Some((TAG_KEY, WireType::LengthDelimited)) => {
                    let bytes = reader.read_length_delimited()?;
                    break Self::decode_key(bytes).map(Some);
                }
                Some((_, wire_type)) => reader.skip(wire_type)?,
            }
        };
        self.cursor = reader.position();
        result
    }

    /// Reads up to `max` keys, stopping early at end of file.
    ///
    /// # Errors
    ///
    /// As [`Self::next_key`].
    pub fn read_batch(&mut self, max: usize) -> Result<Vec<TemporaryExposureKey>, ExportError> {
        let mut keys = Vec::with_capacity(max.min(256));
        while keys.len() < max {
            match self.next_key()? {
                Some(key) => keys.push(key),
                None => break,
            }
        }
        Ok(keys)
    }

    fn decode_key(bytes: &[u8]) -> Result<TemporaryExposureKey, ExportError> {
        let record = proto::KeyRecord::decode(bytes)?;
        let key_data: [u8; TEK_LEN] =
            record
                .key_data
                .as_slice()
                .try_into()
                .map_err(|_| ExportError::BadFormat {
                    reason: format!("key data is {} bytes, expected {TEK_LEN}", record.key_data.len()),
                })?;
        let transmission_risk_level = record.transmission_risk_level.unwrap_or(0);
        if transmission_risk_level > 7 {
            warn!(transmission_risk_level, "clamping out-of-range transmission risk");
        }
        Ok(TemporaryExposureKey {
            key_data,
            rolling_start_number: record.rolling_start_interval_number.unwrap_or(0),
            rolling_period: record.rolling_period,
            transmission_risk_level: u8::try_from(transmission_risk_level.min(7)).unwrap_or(7),
        })
    }
}

/// Builds TEK export files; the encoding dual of [`ExportReader`].
#[derive(Debug)]
pub struct ExportWriter {
    writer: StreamWriter,
}

impl ExportWriter {
    /// Starts an export file with the identifier and metadata fields.
    #[must_use]
    pub fn new(metadata: &ExportMetadata) -> Self {
        let mut writer = StreamWriter::new();
        writer.write_raw(EXPORT_IDENTIFIER);
        if let Some(ts) = metadata.start_timestamp {
            writer.write_fixed64_field(TAG_START_TIMESTAMP, ts);
        }
        if let Some(ts) = metadata.end_timestamp {
            writer.write_fixed64_field(TAG_END_TIMESTAMP, ts);
        }
        if let Some(region) = &metadata.region {
            writer.write_string_field(TAG_REGION, region);
        }
        if let Some(batch_number) = metadata.batch_number {
            writer.write_varint_field(TAG_BATCH_NUMBER, u64::from(batch_number));
        }
        if let Some(batch_size) = metadata.batch_size {
            writer.write_varint_field(TAG_BATCH_SIZE, u64::from(batch_size));
        }
        for info in &metadata.signature_infos {
            let record = proto::SignatureInfo {
                apple_bundle_id: info.apple_bundle_id.clone(),
                android_package: info.android_package.clone(),
                verification_key_version: info.verification_key_version.clone(),
                verification_key_id: info.verification_key_id.clone(),
                signature_algorithm: info.signature_algorithm.clone(),
            };
            writer.write_bytes_field(TAG_SIGNATURE_INFO, &record.encode_to_vec());
        }
        Self { writer }
    }

    /// Appends one key record.
    pub fn write_key(&mut self, key: &TemporaryExposureKey) {
        let record = proto::KeyRecord {
            key_data: key.key_data.to_vec(),
            transmission_risk_level: Some(u32::from(key.transmission_risk_level)),
            rolling_start_interval_number: Some(key.rolling_start_number),
            rolling_period: key.rolling_period,
        };
        self.writer.write_bytes_field(TAG_KEY, &record.encode_to_vec());
    }

    /// Finishes the file and returns its bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.writer.into_bytes()
    }
}

/// One parsed signature record from a signature file.
#[derive(Debug, Clone)]
pub struct SignatureRecord {
    /// Signer identity.
    pub signature_info: SignatureInfo,
    /// Batch number the signature covers.
    pub batch_number: u32,
    /// Total batches in the export.
    pub batch_size: u32,
    /// X9.62-encoded ECDSA P-256 signature over the batch file SHA-256.
    pub signature_data: Vec<u8>,
}

/// A parsed signature file.
#[derive(Debug, Clone, Default)]
pub struct SignatureFile {
    /// All signatures carried by the file.
    pub signatures: Vec<SignatureRecord>,
}

impl SignatureFile {
    /// Decodes a signature file.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::BadFormat`] if the protobuf does not
    /// decode.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ExportError> {
        let list = proto::TekSignatureList::decode(data)?;
        let signatures = list
            .signatures
            .into_iter()
            .map(|s| SignatureRecord {
                signature_info: s.signature_info.map(Into::into).unwrap_or_default(),
                batch_number: s.batch_num.unwrap_or(0),
                batch_size: s.batch_size.unwrap_or(0),
                signature_data: s.signature.unwrap_or_default(),
            })
            .collect();
        Ok(Self { signatures })
    }

    /// Reads and decodes a signature file from disk.
    ///
    /// # Errors
    ///
    /// As [`Self::from_bytes`], plus I/O errors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Encodes the signature file, for tooling and tests.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let list = proto::TekSignatureList {
            signatures: self
                .signatures
                .iter()
                .map(|s| proto::TekSignature {
                    signature_info: Some(proto::SignatureInfo {
                        apple_bundle_id: s.signature_info.apple_bundle_id.clone(),
                        android_package: s.signature_info.android_package.clone(),
                        verification_key_version: s.signature_info.verification_key_version.clone(),
                        verification_key_id: s.signature_info.verification_key_id.clone(),
                        signature_algorithm: s.signature_info.signature_algorithm.clone(),
                    }),
                    batch_num: Some(s.batch_number),
                    batch_size: Some(s.batch_size),
                    signature: Some(s.signature_data.clone()),
                })
                .collect(),
        };
        list.encode_to_vec()
    }
}

/// External seam for batch signature verification.
///
/// The expected algorithm is ECDSA P-256 with SHA-256 over the full
/// export file, in X9.62 signature encoding; implementations live
/// outside this core.
pub trait SignatureVerifier {
    /// Checks `record` against the export file's SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::SignatureInvalid`] when verification fails.
    fn verify(&self, file_sha256: &[u8; 32], record: &SignatureRecord) -> Result<(), ExportError>;
}
