//! XML signatures, assertion encryption and the credentials behind them.

mod algorithm;
mod certificate;
mod cipher;
mod signer;

pub use algorithm::{
    parse_protocol_version, supports_xmlenc11, DataEncryptionAlgorithm, DigestAlgorithm,
    KeyAgreementAlgorithm, KeyTransportAlgorithm, SignatureAlgorithm,
};
pub use certificate::{
    certificate_from_base64, certificate_to_base64, fingerprint, same_certificate, subject_name,
    CertificateValidator, Credential,
};
pub use cipher::ProtocolCipher;
pub use signer::{ProtocolSigner, SignatureKeyInfo};

#[cfg(test)]
pub(crate) use certificate::test_support;
