// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Decoding of [RFC 6962](https://datatracker.ietf.org/doc/html/rfc6962) log
//! leaves into the certificate metadata that `ct-dump` persists.
//!
//! A leaf as returned by `get-entries` is an opaque `MerkleTreeLeaf`. The
//! [`EntryDecoder`] capability turns it into a [`LogEntry`], which carries the
//! leaf index and timestamp plus the fields extracted from either the final
//! certificate or the precertificate's `TBSCertificate`.
//!
//! # Examples
//!
//! ```
//! use ct_entry::{EntryDecoder, MerkleTreeLeaf, RawLeaf, Rfc6962Decoder, SignedEntry};
//!
//! let leaf = MerkleTreeLeaf {
//!     timestamp: 1_704_067_200_000,
//!     entry: SignedEntry::X509(vec![0x30, 0x00]),
//!     extensions: Vec::new(),
//! };
//! let raw = RawLeaf {
//!     index: 7,
//!     leaf_input: leaf.to_bytes().unwrap(),
//! };
//!
//! // An empty SEQUENCE is not a certificate, so decoding fails.
//! assert!(Rfc6962Decoder.decode(&raw).is_err());
//! ```

pub mod cert;
pub mod codec;
pub mod rfc6962;

pub use cert::*;
pub use rfc6962::*;

/// Unix timestamp, measured since the epoch (January 1, 1970, 00:00),
/// ignoring leap seconds, in milliseconds.
/// This can be unsigned as we never deal with negative timestamps.
pub type UnixTimestamp = u64;

/// Index of a leaf in the log.
pub type LeafIndex = u64;

/// Text exactly as it appeared in a certificate, after ASN.1 string-type
/// decoding. Certificates in the wild carry all sorts of malformed strings,
/// so this is not guaranteed to be valid UTF-8.
pub type RawText = Vec<u8>;

/// One undecoded leaf, as served by the log's `get-entries` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLeaf {
    /// Position of the leaf in the log. Not part of the leaf itself; the log
    /// assigns it by position within the requested range.
    pub index: LeafIndex,

    /// The marshaled `MerkleTreeLeaf`.
    pub leaf_input: Vec<u8>,
}

/// A decoded log leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    /// The zero-based index of the leaf in the log.
    pub index: LeafIndex,

    /// The `TimestampedEntry.timestamp`.
    pub timestamp: UnixTimestamp,

    /// True if `LogEntryType` is `precert_entry`, in which case
    /// `certificate` was extracted from the `PreCert.tbs_certificate`.
    pub is_precert: bool,

    pub certificate: CertificateFields,
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    DER(#[from] der::Error),
    #[error("unsupported leaf version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown leaf type {0}")]
    UnknownLeafType(u8),
    #[error("unknown entry type {0}")]
    UnknownEntryType(u16),
    #[error("trailing data")]
    TrailingData,
}

/// Turns one raw log leaf into a [`LogEntry`].
pub trait EntryDecoder {
    /// Decode the leaf.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the leaf is neither a valid certificate
    /// entry nor a valid precertificate entry.
    fn decode(&self, leaf: &RawLeaf) -> Result<LogEntry, DecodeError>;
}

/// Decoder for RFC 6962 `MerkleTreeLeaf` structures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6962Decoder;

impl EntryDecoder for Rfc6962Decoder {
    fn decode(&self, leaf: &RawLeaf) -> Result<LogEntry, DecodeError> {
        let parsed = MerkleTreeLeaf::from_bytes(&leaf.leaf_input)?;
        let (is_precert, certificate) = match &parsed.entry {
            SignedEntry::X509(der) => (false, CertificateFields::from_certificate_der(der)?),
            SignedEntry::Precert {
                tbs_certificate, ..
            } => (true, CertificateFields::from_tbs_der(tbs_certificate)?),
        };

        Ok(LogEntry {
            index: leaf.index,
            timestamp: parsed.timestamp,
            is_precert,
            certificate,
        })
    }
}
