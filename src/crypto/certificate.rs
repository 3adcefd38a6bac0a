use std::cmp::Ordering;

use base64::{prelude::BASE64_STANDARD, Engine};
use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    x509::{X509Ref, X509VerifyResult, X509},
};
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    error::{EngineError, EngineResult, ErrorKey},
    utils::decode_xml_base64,
};

/// A certificate with, for our own credentials, its private key.
#[derive(Clone)]
pub struct Credential {
    certificate: X509,
    private_key: Option<PKey<Private>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &subject_name(&self.certificate))
            .field("private_key", &self.private_key.is_some())
            .finish()
    }
}

impl Credential {
    pub fn new(certificate: X509, private_key: Option<PKey<Private>>) -> Self {
        Self {
            certificate,
            private_key,
        }
    }

    pub fn from_pem(certificate_pem: &[u8], private_key_pem: Option<&[u8]>) -> EngineResult<Self> {
        let certificate = X509::from_pem(certificate_pem)?;
        let private_key = private_key_pem
            .map(PKey::private_key_from_pem)
            .transpose()?;
        Ok(Self::new(certificate, private_key))
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn public_key(&self) -> EngineResult<PKey<Public>> {
        Ok(self.certificate.public_key()?)
    }

    pub fn private_key(&self) -> EngineResult<&PKey<Private>> {
        self.private_key.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!(
                "no private key for {}",
                subject_name(&self.certificate)
            ))
        })
    }

    /// Base64 DER as carried in `ds:X509Certificate`.
    pub fn certificate_base64(&self) -> EngineResult<String> {
        certificate_to_base64(&self.certificate)
    }

    pub fn fingerprint(&self) -> EngineResult<String> {
        fingerprint(&self.certificate)
    }
}

pub fn certificate_to_base64(certificate: &X509Ref) -> EngineResult<String> {
    Ok(BASE64_STANDARD.encode(certificate.to_der()?))
}

pub fn certificate_from_base64(encoded: &str) -> EngineResult<X509> {
    let der = decode_xml_base64(encoded)?;
    X509::from_der(&der).map_err(|e| {
        EngineError::certificate(
            ErrorKey::SamlEngineInvalidCertificate,
            format!("unreadable certificate: {e}"),
        )
    })
}

/// Lower case hex SHA-256 of the DER encoding.
pub fn fingerprint(certificate: &X509Ref) -> EngineResult<String> {
    Ok(hex::encode(certificate.digest(MessageDigest::sha256())?))
}

pub fn subject_name(certificate: &X509Ref) -> String {
    certificate
        .subject_name()
        .entries()
        .filter_map(|entry| {
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{}={}", entry.object().nid().short_name().ok()?, value))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn same_certificate(a: &X509Ref, b: &X509Ref) -> bool {
    match (a.to_der(), b.to_der()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The checks a certificate passes before a signature made with it is
/// trusted. Each check can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateValidator {
    pub check_validity_period: bool,
    pub disallow_self_signed: bool,
}

impl Default for CertificateValidator {
    fn default() -> Self {
        Self {
            check_validity_period: true,
            disallow_self_signed: false,
        }
    }
}

impl CertificateValidator {
    pub fn validate(&self, certificate: &X509Ref, now: OffsetDateTime) -> EngineResult<()> {
        if self.check_validity_period {
            let now = Asn1Time::from_unix(now.unix_timestamp() as _)?;
            let not_yet_valid = certificate.not_before().compare(&now)? == Ordering::Greater;
            let expired = certificate.not_after().compare(&now)? != Ordering::Greater;
            if not_yet_valid || expired {
                warn!(subject = %subject_name(certificate), "certificate outside its validity period");
                return Err(EngineError::certificate(
                    ErrorKey::SamlEngineInvalidCertificate,
                    format!(
                        "certificate {} is valid from {} to {}",
                        subject_name(certificate),
                        certificate.not_before(),
                        certificate.not_after()
                    ),
                ));
            }
        }
        if self.disallow_self_signed && is_self_signed(certificate)? {
            warn!(subject = %subject_name(certificate), "self-signed certificate rejected");
            return Err(EngineError::certificate(
                ErrorKey::SamlEngineInvalidCertificate,
                format!("certificate {} is self-signed", subject_name(certificate)),
            ));
        }
        Ok(())
    }
}

fn is_self_signed(certificate: &X509Ref) -> EngineResult<bool> {
    if certificate.issued(certificate) != X509VerifyResult::OK {
        return Ok(false);
    }
    let key = certificate.public_key()?;
    Ok(certificate.verify(&key).unwrap_or(false))
}

#[cfg(test)]
pub(crate) mod test_support {
    use openssl::{
        asn1::Asn1Time,
        bn::{BigNum, MsbOption},
        ec::{EcGroup, EcKey},
        hash::MessageDigest,
        nid::Nid,
        pkey::PKey,
        rsa::Rsa,
        x509::{X509NameBuilder, X509},
    };

    use super::Credential;

    pub fn self_signed(common_name: &str, key: PKey<openssl::pkey::Private>, days: (u32, u32)) -> Credential {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let not_before = Asn1Time::from_unix(
            time::OffsetDateTime::now_utc().unix_timestamp() - i64::from(days.0) * 86_400,
        )
        .unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(days.1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        Credential::new(builder.build(), Some(key))
    }

    pub fn rsa_credential(common_name: &str) -> Credential {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        self_signed(common_name, key, (1, 365))
    }

    pub fn ec_credential(common_name: &str) -> Credential {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        self_signed(common_name, key, (1, 365))
    }
}

#[cfg(test)]
mod tests {
    use openssl::{pkey::PKey, rsa::Rsa};

    use super::{test_support::*, *};

    #[test]
    fn can_accept_valid_certificate() {
        let credential = rsa_credential("proxy.be");
        CertificateValidator::default()
            .validate(credential.certificate(), OffsetDateTime::now_utc())
            .unwrap();
        assert_eq!(credential.fingerprint().unwrap().len(), 64);
        let decoded = certificate_from_base64(&credential.certificate_base64().unwrap()).unwrap();
        assert!(same_certificate(&decoded, credential.certificate()));
    }

    #[test]
    fn can_reject_expired_certificate() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let credential = self_signed("old.be", key, (30, 0));
        let later = OffsetDateTime::now_utc() + time::Duration::days(2);
        let err = CertificateValidator::default()
            .validate(credential.certificate(), later)
            .unwrap_err();
        assert!(matches!(err, EngineError::CertificateRejected { .. }));

        let lenient = CertificateValidator {
            check_validity_period: false,
            ..CertificateValidator::default()
        };
        lenient.validate(credential.certificate(), later).unwrap();
    }

    #[test]
    fn can_reject_self_signed_when_configured() {
        let credential = rsa_credential("self.be");
        let strict = CertificateValidator {
            disallow_self_signed: true,
            ..CertificateValidator::default()
        };
        assert!(strict
            .validate(credential.certificate(), OffsetDateTime::now_utc())
            .is_err());
    }
}
