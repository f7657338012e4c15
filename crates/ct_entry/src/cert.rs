// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Extraction of the persisted certificate fields from X.509 structures.

use crate::{DecodeError, RawText, UnixTimestamp};
use der::{oid::ObjectIdentifier, Tag, Tagged};
use x509_cert::{
    der::Decode,
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    time::Time,
    Certificate, TbsCertificate,
};

/// `id-at-commonName`.
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
/// `id-at-organizationName`.
const ORGANIZATION_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");

/// The certificate metadata persisted for each log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateFields {
    pub issuer_common_name: RawText,
    pub issuer_organizations: Vec<RawText>,
    pub subject_common_name: RawText,
    pub subject_organizations: Vec<RawText>,
    pub not_before: UnixTimestamp,
    pub not_after: UnixTimestamp,
    /// `dNSName` entries of the subject alternative name extension, in
    /// certificate order.
    pub dns_names: Vec<RawText>,
}

impl CertificateFields {
    /// Extract fields from a DER-encoded `Certificate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a well-formed certificate.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, DecodeError> {
        Self::from_tbs(&Certificate::from_der(der)?.tbs_certificate)
    }

    /// Extract fields from a DER-encoded `TBSCertificate`, as logged for
    /// precertificates.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a well-formed `TBSCertificate`.
    pub fn from_tbs_der(der: &[u8]) -> Result<Self, DecodeError> {
        Self::from_tbs(&TbsCertificate::from_der(der)?)
    }

    /// Extract fields from a parsed `TBSCertificate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject alternative name extension is
    /// malformed.
    pub fn from_tbs(tbs: &TbsCertificate) -> Result<Self, DecodeError> {
        let dns_names = match tbs.get::<SubjectAltName>()? {
            Some((_, san)) => san
                .0
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DnsName(dns) => Some(dns.to_string().into_bytes()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            issuer_common_name: common_name(&tbs.issuer),
            issuer_organizations: organizations(&tbs.issuer),
            subject_common_name: common_name(&tbs.subject),
            subject_organizations: organizations(&tbs.subject),
            not_before: unix_millis(&tbs.validity.not_before),
            not_after: unix_millis(&tbs.validity.not_after),
            dns_names,
        })
    }
}

fn attributes<'a>(
    name: &'a Name,
    oid: ObjectIdentifier,
) -> impl Iterator<Item = RawText> + 'a {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(move |atv| atv.oid == oid)
        .map(|atv| directory_string(atv.value.tag(), atv.value.value()))
}

// When a name carries several CNs, the last one wins.
fn common_name(name: &Name) -> RawText {
    attributes(name, COMMON_NAME).last().unwrap_or_default()
}

fn organizations(name: &Name) -> Vec<RawText> {
    attributes(name, ORGANIZATION_NAME).collect()
}

/// Converts the contents of an X.520 `DirectoryString` (or any other string
/// type a CA saw fit to use) to UTF-8 where the encoding is known. Invalid
/// sequences are passed through untouched.
fn directory_string(tag: Tag, value: &[u8]) -> RawText {
    match tag {
        // Latin-1 is what CAs actually put in T61String.
        Tag::TeletexString => value.iter().map(|&b| char::from(b)).collect::<String>().into(),
        Tag::BmpString => {
            let units: Vec<u16> = value
                .chunks(2)
                .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
                .collect();
            String::from_utf16_lossy(&units).into_bytes()
        }
        _ => value.to_vec(),
    }
}

fn unix_millis(time: &Time) -> UnixTimestamp {
    u64::try_from(time.to_unix_duration().as_millis()).unwrap_or(u64::MAX)
}
