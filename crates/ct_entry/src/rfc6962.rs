// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The [RFC 6962 `MerkleTreeLeaf`](https://datatracker.ietf.org/doc/html/rfc6962#section-3.4)
//! wire format, as found in the `leaf_input` field of `get-entries` responses.
//!
//! ```text
//! struct {
//!     Version version;
//!     MerkleLeafType leaf_type;
//!     select (leaf_type) {
//!         case timestamped_entry: TimestampedEntry;
//!     }
//! } MerkleTreeLeaf;
//!
//! struct {
//!     uint64 timestamp;
//!     LogEntryType entry_type;
//!     select(entry_type) {
//!         case x509_entry: ASN.1Cert;
//!         case precert_entry: PreCert;
//!     } signed_entry;
//!     CtExtensions extensions;
//! } TimestampedEntry;
//!
//! struct {
//!     opaque issuer_key_hash[32];
//!     TBSCertificate tbs_certificate;
//! } PreCert;
//! ```

use crate::codec::{ReadLengthPrefixedBytesExt, WriteLengthPrefixedBytesExt};
use crate::{DecodeError, UnixTimestamp};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// `Version.v1`.
const VERSION_V1: u8 = 0;
/// `MerkleLeafType.timestamped_entry`.
const TIMESTAMPED_ENTRY: u8 = 0;
/// `LogEntryType.x509_entry`.
const X509_ENTRY: u16 = 0;
/// `LogEntryType.precert_entry`.
const PRECERT_ENTRY: u16 = 1;

/// The `signed_entry` of a `TimestampedEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedEntry {
    /// A DER-encoded final certificate.
    X509(Vec<u8>),
    /// A precertificate, logged as the DER-encoded `TBSCertificate` with the
    /// poison extension removed.
    Precert {
        issuer_key_hash: [u8; 32],
        tbs_certificate: Vec<u8>,
    },
}

/// A parsed `MerkleTreeLeaf` of type `timestamped_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTreeLeaf {
    /// The `TimestampedEntry.timestamp`.
    pub timestamp: UnixTimestamp,

    pub entry: SignedEntry,

    /// The opaque `CtExtensions`. RFC 6962 logs leave this empty.
    pub extensions: Vec<u8>,
}

impl MerkleTreeLeaf {
    /// Parse a marshaled `MerkleTreeLeaf`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the version, leaf type or entry type is
    /// unknown, if the input is truncated, or if bytes remain after the leaf.
    pub fn from_bytes(input: &[u8]) -> Result<Self, DecodeError> {
        let mut s = Cursor::new(input);

        let version = s.read_u8()?;
        if version != VERSION_V1 {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let leaf_type = s.read_u8()?;
        if leaf_type != TIMESTAMPED_ENTRY {
            return Err(DecodeError::UnknownLeafType(leaf_type));
        }

        let timestamp = s.read_u64::<BigEndian>()?;
        let entry = match s.read_u16::<BigEndian>()? {
            X509_ENTRY => SignedEntry::X509(s.read_length_prefixed(3)?),
            PRECERT_ENTRY => {
                let mut issuer_key_hash = [0; 32];
                s.read_exact(&mut issuer_key_hash)?;
                SignedEntry::Precert {
                    issuer_key_hash,
                    tbs_certificate: s.read_length_prefixed(3)?,
                }
            }
            entry_type => return Err(DecodeError::UnknownEntryType(entry_type)),
        };
        let extensions = s.read_length_prefixed(2)?;

        if s.position() != input.len() as u64 {
            return Err(DecodeError::TrailingData);
        }

        Ok(Self {
            timestamp,
            entry,
            extensions,
        })
    }

    /// Returns the marshaled `MerkleTreeLeaf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or extensions are too long for
    /// their length prefixes (2^24-1 and 2^16-1 bytes respectively).
    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buffer = vec![VERSION_V1, TIMESTAMPED_ENTRY];

        buffer.write_u64::<BigEndian>(self.timestamp)?;
        match &self.entry {
            SignedEntry::X509(certificate) => {
                buffer.write_u16::<BigEndian>(X509_ENTRY)?;
                buffer.write_length_prefixed(certificate, 3)?;
            }
            SignedEntry::Precert {
                issuer_key_hash,
                tbs_certificate,
            } => {
                buffer.write_u16::<BigEndian>(PRECERT_ENTRY)?;
                buffer.extend_from_slice(issuer_key_hash);
                buffer.write_length_prefixed(tbs_certificate, 3)?;
            }
        }
        buffer.write_length_prefixed(&self.extensions, 2)?;

        Ok(buffer)
    }
}
