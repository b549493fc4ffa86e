//! Client certificate as surfaced to handlers.
//!
//! The listener never judges trust. It only parses enough of what the peer
//! presented (subject, issuer, serial, extended key usages) for a handler to
//! decide whether the certificate is acceptable.

use std::fmt;
use std::sync::Arc;

use x509_parser::extensions::ParsedExtension;

use crate::tls::error::TransportError;

/// `id-kp-serverAuth`
pub const OID_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
/// `id-kp-clientAuth`
pub const OID_CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";
/// Microsoft Smart Card Logon.
pub const OID_SMART_CARD_LOGON: &str = "1.3.6.1.4.1.311.20.2.2";

const OID_ANY_EXTENDED_KEY_USAGE: &str = "2.5.29.37.0";
const OID_CODE_SIGNING: &str = "1.3.6.1.5.5.7.3.3";
const OID_EMAIL_PROTECTION: &str = "1.3.6.1.5.5.7.3.4";
const OID_TIME_STAMPING: &str = "1.3.6.1.5.5.7.3.8";
const OID_OCSP_SIGNING: &str = "1.3.6.1.5.5.7.3.9";

/// A certificate presented by the peer, plus parsed metadata.
///
/// Cloning is cheap; the DER and metadata live behind an `Arc` because the
/// same certificate is handed to every request on the connection.
#[derive(Clone)]
pub struct ClientCertificate {
    inner: Arc<CertificateInner>,
}

struct CertificateInner {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    extended_key_usages: Vec<String>,
}

impl ClientCertificate {
    /// Parse a DER-encoded X.509 certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, TransportError> {
        let der = der.into();
        let (subject, issuer, serial, extended_key_usages) = {
            let (_, cert) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| TransportError::MalformedCertificate(e.to_string()))?;

            let mut usages = Vec::new();
            for ext in cert.extensions() {
                if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
                    let flagged = [
                        (eku.any, OID_ANY_EXTENDED_KEY_USAGE),
                        (eku.server_auth, OID_SERVER_AUTH),
                        (eku.client_auth, OID_CLIENT_AUTH),
                        (eku.code_signing, OID_CODE_SIGNING),
                        (eku.email_protection, OID_EMAIL_PROTECTION),
                        (eku.time_stamping, OID_TIME_STAMPING),
                        (eku.ocsp_signing, OID_OCSP_SIGNING),
                    ];
                    usages.extend(
                        flagged
                            .iter()
                            .filter(|(set, _)| *set)
                            .map(|(_, oid)| oid.to_string()),
                    );
                    usages.extend(eku.other.iter().map(|oid| oid.to_id_string()));
                }
            }

            (
                cert.subject().to_string(),
                cert.issuer().to_string(),
                cert.raw_serial_as_string(),
                usages,
            )
        };

        Ok(Self {
            inner: Arc::new(CertificateInner {
                der,
                subject,
                issuer,
                serial,
                extended_key_usages,
            }),
        })
    }

    /// Raw DER bytes as presented on the wire.
    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    /// Serial number as colon-separated hex.
    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    /// Extended key usage OIDs in dotted form, in certificate order.
    pub fn extended_key_usages(&self) -> &[String] {
        &self.inner.extended_key_usages
    }

    /// True if the certificate is marked for TLS client authentication.
    pub fn has_client_auth_usage(&self) -> bool {
        self.has_usage(OID_CLIENT_AUTH)
    }

    pub fn is_smart_card_logon(&self) -> bool {
        self.has_usage(OID_SMART_CARD_LOGON)
    }

    fn has_usage(&self, oid: &str) -> bool {
        self.inner.extended_key_usages.iter().any(|u| u == oid)
    }
}

impl PartialEq for ClientCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.der == other.inner.der
    }
}

impl Eq for ClientCertificate {}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("subject", &self.inner.subject)
            .field("issuer", &self.inner.issuer)
            .field("serial", &self.inner.serial)
            .field("extended_key_usages", &self.inner.extended_key_usages)
            .finish()
    }
}
