//! Algorithm suites for XML signature and XML encryption.

use std::{fmt, str::FromStr};

use openssl::{hash::MessageDigest, symm::Cipher};

use crate::error::{EngineError, EngineResult, ErrorKey};

pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXCLUSIVE_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const INCLUSIVE_C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const INCLUSIVE_C14N_WITH_COMMENTS: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const CONCAT_KDF: &str = "http://www.w3.org/2009/xmlenc11#ConcatKDF";
pub const KEY_WRAP_AES256: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";
pub const MGF1_SHA256: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha256";
const MGF1_PREFIX: &str = "http://www.w3.org/2009/xmlenc11#mgf1";
pub const ELEMENT_TYPE: &str = "http://www.w3.org/2001/04/xmlenc#Element";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|digest| digest.uri() == uri)
    }

    #[must_use]
    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn digest(&self, data: &[u8]) -> EngineResult<Vec<u8>> {
        Ok(openssl::hash::hash(self.message_digest(), data)?.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaSha256,
    RsaSha384,
    RsaSha512,
    RsaSsaPssSha256,
    RsaSsaPssSha384,
    RsaSsaPssSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 9] = [
        Self::RsaSha256,
        Self::RsaSha384,
        Self::RsaSha512,
        Self::RsaSsaPssSha256,
        Self::RsaSsaPssSha384,
        Self::RsaSsaPssSha512,
        Self::EcdsaSha256,
        Self::EcdsaSha384,
        Self::EcdsaSha512,
    ];

    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            Self::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            Self::RsaSsaPssSha256 => "http://www.w3.org/2007/05/xmldsig-more#sha256-rsa-MGF1",
            Self::RsaSsaPssSha384 => "http://www.w3.org/2007/05/xmldsig-more#sha384-rsa-MGF1",
            Self::RsaSsaPssSha512 => "http://www.w3.org/2007/05/xmldsig-more#sha512-rsa-MGF1",
            Self::EcdsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
            Self::EcdsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384",
            Self::EcdsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.uri() == uri)
    }

    #[must_use]
    pub const fn digest(&self) -> DigestAlgorithm {
        match self {
            Self::RsaSha256 | Self::RsaSsaPssSha256 | Self::EcdsaSha256 => DigestAlgorithm::Sha256,
            Self::RsaSha384 | Self::RsaSsaPssSha384 | Self::EcdsaSha384 => DigestAlgorithm::Sha384,
            Self::RsaSha512 | Self::RsaSsaPssSha512 | Self::EcdsaSha512 => DigestAlgorithm::Sha512,
        }
    }

    #[must_use]
    pub const fn is_rsa(&self) -> bool {
        !self.is_ecdsa()
    }

    #[must_use]
    pub const fn is_pss(&self) -> bool {
        matches!(
            self,
            Self::RsaSsaPssSha256 | Self::RsaSsaPssSha384 | Self::RsaSsaPssSha512
        )
    }

    #[must_use]
    pub const fn is_ecdsa(&self) -> bool {
        matches!(
            self,
            Self::EcdsaSha256 | Self::EcdsaSha384 | Self::EcdsaSha512
        )
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s.trim()).ok_or_else(|| {
            EngineError::validation(
                ErrorKey::InvalidSignatureAlgorithm,
                format!("unsupported signature algorithm {s}"),
            )
        })
    }
}

/// Block cipher protecting the assertion itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataEncryptionAlgorithm {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl DataEncryptionAlgorithm {
    pub const ALL: [DataEncryptionAlgorithm; 3] = [Self::Aes128Gcm, Self::Aes192Gcm, Self::Aes256Gcm];

    pub const IV_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;

    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            Self::Aes192Gcm => "http://www.w3.org/2009/xmlenc11#aes192-gcm",
            Self::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.uri() == uri)
    }

    #[must_use]
    pub const fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes192Gcm => 24,
            Self::Aes256Gcm => 32,
        }
    }

    #[must_use]
    pub fn cipher(&self) -> Cipher {
        match self {
            Self::Aes128Gcm => Cipher::aes_128_gcm(),
            Self::Aes192Gcm => Cipher::aes_192_gcm(),
            Self::Aes256Gcm => Cipher::aes_256_gcm(),
        }
    }
}

impl FromStr for DataEncryptionAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s.trim()).ok_or_else(|| {
            EngineError::encryption(
                ErrorKey::InvalidEncryptionAlgorithm,
                format!("unsupported data encryption algorithm {s}"),
            )
        })
    }
}

/// MGF1 digest named by an xmlenc11 `MGF` element.
#[must_use]
pub fn mgf1_digest(uri: &str) -> Option<MessageDigest> {
    Some(match uri.strip_prefix(MGF1_PREFIX)? {
        "sha1" => MessageDigest::sha1(),
        "sha224" => MessageDigest::sha224(),
        "sha256" => MessageDigest::sha256(),
        "sha384" => MessageDigest::sha384(),
        "sha512" => MessageDigest::sha512(),
        _ => return None,
    })
}

/// RSA key transport of the content-encryption key.
///
/// `RsaOaepMgf1p` is the SHA-1 suite of the 1.x nodes. Peers are moved to
/// it by the protocol version their metadata declares, see
/// [`KeyTransportAlgorithm::for_peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTransportAlgorithm {
    RsaOaep,
    RsaOaepMgf1p,
}

impl KeyTransportAlgorithm {
    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::RsaOaep => "http://www.w3.org/2009/xmlenc11#rsa-oaep",
            Self::RsaOaepMgf1p => "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::RsaOaep, Self::RsaOaepMgf1p]
            .into_iter()
            .find(|alg| alg.uri() == uri)
    }

    /// OAEP digest and MGF1 digest used when encrypting. Decryption follows
    /// whatever the `EncryptionMethod` names, see [`mgf1_digest`].
    #[must_use]
    pub const fn digests(&self) -> (DigestAlgorithm, DigestAlgorithm) {
        match self {
            Self::RsaOaep => (DigestAlgorithm::Sha256, DigestAlgorithm::Sha256),
            Self::RsaOaepMgf1p => (DigestAlgorithm::Sha1, DigestAlgorithm::Sha1),
        }
    }

    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        matches!(self, Self::RsaOaepMgf1p)
    }

    /// Resolves the suite to use with a peer. Nodes that do not declare
    /// protocol 1.2 or later only understand the legacy suite.
    #[must_use]
    pub fn for_peer(configured: Self, peer_protocol_versions: &[String]) -> Self {
        if configured == Self::RsaOaep && !supports_xmlenc11(peer_protocol_versions) {
            Self::RsaOaepMgf1p
        } else {
            configured
        }
    }
}

impl FromStr for KeyTransportAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s.trim()).ok_or_else(|| {
            EngineError::encryption(
                ErrorKey::InvalidEncryptionAlgorithm,
                format!("unsupported key transport algorithm {s}"),
            )
        })
    }
}

/// Ephemeral-static ECDH agreement, used when the recipient holds an EC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAgreementAlgorithm {
    EcdhEs,
}

impl KeyAgreementAlgorithm {
    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::EcdhEs => "http://www.w3.org/2009/xmlenc11#ECDH-ES",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        (uri == Self::EcdhEs.uri()).then_some(Self::EcdhEs)
    }
}

impl FromStr for KeyAgreementAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s.trim()).ok_or_else(|| {
            EngineError::encryption(
                ErrorKey::InvalidEncryptionAlgorithm,
                format!("unsupported key agreement algorithm {s}"),
            )
        })
    }
}

/// `(major, minor)` of a protocol version string such as `1.2`.
#[must_use]
pub fn parse_protocol_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// True when the highest declared version is at least 1.2.
#[must_use]
pub fn supports_xmlenc11(protocol_versions: &[String]) -> bool {
    protocol_versions
        .iter()
        .filter_map(|v| parse_protocol_version(v))
        .max()
        .is_some_and(|highest| highest >= (1, 2))
}
