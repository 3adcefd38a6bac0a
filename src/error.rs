//! Engine error types.
//!
//! Every failure carries an [`ErrorKey`], the stable eIDAS error identifier
//! peers and operators recognise, and belongs to one [`ErrorCategory`].

use std::{collections::HashMap, fmt};

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Stable eIDAS error identifiers.
///
/// The numeric code and the human readable message of each key are looked
/// up in an [`ErrorCatalog`] under `<id>.code` and `<id>.message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKey {
    InternalError,
    MessageValidationError,
    MessageFormatUnsupported,
    ColleagueRequestAttrNull,
    ColleagueRequestInvalidSaml,
    ColleagueRequestInvalidCountryCode,
    ColleagueRequestInvalidDestUrl,
    ColleagueRequestInvalidLoa,
    ColleagueRequestInconsistentSpType,
    ColleagueRequestMissingSpType,
    ColleagueResponseInvalidSaml,
    AttVerificationMandatory,
    AudienceRestriction,
    AuRequestId,
    InvalidAttributeList,
    InvalidAttributeValue,
    InvalidCertificateSign,
    InvalidSignatureAlgorithm,
    InvalidProtocolBinding,
    InvalidAssertionSignature,
    InvalidEncryptionAlgorithm,
    InvalidRequesterId,
    SamlEngineConfigurationError,
    SamlEngineInvalidCertificate,
    SamlEngineUntrustedCertificate,
    SamlEngineInvalidMetadata,
    SamlEngineInvalidMetadataSource,
    SamlEngineNoMetadata,
    SamlEngineUnencryptedResponse,
    SamlEngineDecryptingResponse,
    EidasMandatoryAttributes,
    EidasRepresentativeAttributes,
    ConnectorInvalidSpType,
    InvalidResponseLoaValue,
    IllegalArgumentsInBuilder,
    ProtocolVersionUnsupported,
    AuthenticationFailed,
}

impl ErrorKey {
    pub const ALL: [ErrorKey; 37] = [
        ErrorKey::InternalError,
        ErrorKey::MessageValidationError,
        ErrorKey::MessageFormatUnsupported,
        ErrorKey::ColleagueRequestAttrNull,
        ErrorKey::ColleagueRequestInvalidSaml,
        ErrorKey::ColleagueRequestInvalidCountryCode,
        ErrorKey::ColleagueRequestInvalidDestUrl,
        ErrorKey::ColleagueRequestInvalidLoa,
        ErrorKey::ColleagueRequestInconsistentSpType,
        ErrorKey::ColleagueRequestMissingSpType,
        ErrorKey::ColleagueResponseInvalidSaml,
        ErrorKey::AttVerificationMandatory,
        ErrorKey::AudienceRestriction,
        ErrorKey::AuRequestId,
        ErrorKey::InvalidAttributeList,
        ErrorKey::InvalidAttributeValue,
        ErrorKey::InvalidCertificateSign,
        ErrorKey::InvalidSignatureAlgorithm,
        ErrorKey::InvalidProtocolBinding,
        ErrorKey::InvalidAssertionSignature,
        ErrorKey::InvalidEncryptionAlgorithm,
        ErrorKey::InvalidRequesterId,
        ErrorKey::SamlEngineConfigurationError,
        ErrorKey::SamlEngineInvalidCertificate,
        ErrorKey::SamlEngineUntrustedCertificate,
        ErrorKey::SamlEngineInvalidMetadata,
        ErrorKey::SamlEngineInvalidMetadataSource,
        ErrorKey::SamlEngineNoMetadata,
        ErrorKey::SamlEngineUnencryptedResponse,
        ErrorKey::SamlEngineDecryptingResponse,
        ErrorKey::EidasMandatoryAttributes,
        ErrorKey::EidasRepresentativeAttributes,
        ErrorKey::ConnectorInvalidSpType,
        ErrorKey::InvalidResponseLoaValue,
        ErrorKey::IllegalArgumentsInBuilder,
        ErrorKey::ProtocolVersionUnsupported,
        ErrorKey::AuthenticationFailed,
    ];

    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            Self::InternalError => "internalError",
            Self::MessageValidationError => "message.validation.error",
            Self::MessageFormatUnsupported => "samlengine.message.format.unsupported",
            Self::ColleagueRequestAttrNull => "colleagueRequest.attrNull",
            Self::ColleagueRequestInvalidSaml => "colleagueRequest.invalidSAML",
            Self::ColleagueRequestInvalidCountryCode => "colleagueRequest.invalidCountryCode",
            Self::ColleagueRequestInvalidDestUrl => "colleagueRequest.invalidDestUrl",
            Self::ColleagueRequestInvalidLoa => "colleagueRequest.invalidLoA",
            Self::ColleagueRequestInconsistentSpType => "inconsistent.sptype",
            Self::ColleagueRequestMissingSpType => "missing.sptype",
            Self::ColleagueResponseInvalidSaml => "colleagueResponse.invalidSAML",
            Self::AttVerificationMandatory => "attVerification.mandatory",
            Self::AudienceRestriction => "audience.restriction.error",
            Self::AuRequestId => "auRequestIdError",
            Self::InvalidAttributeList => "invalidAttributeList",
            Self::InvalidAttributeValue => "invalidAttributeValue",
            Self::InvalidCertificateSign => "invalidCertificateSign.error",
            Self::InvalidSignatureAlgorithm => "invalidReceivedSignAlgo.error",
            Self::InvalidProtocolBinding => "invalidProtocolBinding.error",
            Self::InvalidAssertionSignature => "invalidSamlAssertionSignature.error",
            Self::InvalidEncryptionAlgorithm => "invalidEncryptionAlgorithm.error",
            Self::InvalidRequesterId => "sProviderAction.invalidRequesterId",
            Self::SamlEngineConfigurationError => "samlEngine.configuration.error",
            Self::SamlEngineInvalidCertificate => "samlengine.invalid.certificate",
            Self::SamlEngineUntrustedCertificate => "samlengine.untrusted.certificate",
            Self::SamlEngineInvalidMetadata => "samlengine.invalid.metadata.error",
            Self::SamlEngineInvalidMetadataSource => "samlengine.invalid.metadata.source.error",
            Self::SamlEngineNoMetadata => "samlengine.metadata.retrieval.error",
            Self::SamlEngineUnencryptedResponse => "samlengine.unencrypted.response",
            Self::SamlEngineDecryptingResponse => "samlengine.decrypting.response",
            Self::EidasMandatoryAttributes => "missing.mandatory.attribute",
            Self::EidasRepresentativeAttributes => "request.representative.attribute",
            Self::ConnectorInvalidSpType => "connector.invalid.sptype",
            Self::InvalidResponseLoaValue => "idp.incorrect.loa",
            Self::IllegalArgumentsInBuilder => "illegal.arguments.in.builder",
            Self::ProtocolVersionUnsupported => "protocol.version.unsupported",
            Self::AuthenticationFailed => "authenticationFailed",
        }
    }

    /// Property key holding the numeric code, e.g. `colleagueRequest.invalidLoA.code`.
    #[must_use]
    pub fn error_code(&self) -> String {
        format!("{}.code", self.id())
    }

    /// Property key holding the message, e.g. `colleagueRequest.invalidLoA.message`.
    #[must_use]
    pub fn error_message(&self) -> String {
        format!("{}.message", self.id())
    }

    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.id() == id)
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Engine setup is wrong. Fatal at start-up, not retryable.
    Configuration,
    /// The peer's message is not compliant. Answer with a SAML error response.
    Validation,
    /// Missing, invalid or untrusted signature or certificate.
    Trust,
    /// Unknown, expired or duplicate request id. Possible replay.
    Correlation,
    /// Cache or metadata source could not be reached. The caller may retry.
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{key}: {detail}")]
    Validation { key: ErrorKey, detail: String },

    #[error("attribute value marshalling failed: {0}")]
    Marshalling(String),

    #[error("signature missing or malformed: {0}")]
    MissingSignature(String),

    #[error("{key}: {detail}")]
    InvalidSignature { key: ErrorKey, detail: String },

    /// A certificate failed a configured check (validity period, self-signed).
    #[error("{key}: {detail}")]
    CertificateRejected { key: ErrorKey, detail: String },

    #[error("{key}: {detail}")]
    Encryption { key: ErrorKey, detail: String },

    #[error("{key}: {detail}")]
    Metadata { key: ErrorKey, detail: String },

    #[error("unsolicited response: no pending request with id {0}")]
    UnsolicitedResponse(String),

    #[error("duplicate request id {0}")]
    DuplicateRequestId(String),

    #[error("{key}: {detail}")]
    Unavailable { key: ErrorKey, detail: String },

    #[error("malformed message: {0}")]
    Xml(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

impl EngineError {
    pub fn validation(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::Validation {
            key,
            detail: detail.into(),
        }
    }

    pub fn invalid_signature(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::InvalidSignature {
            key,
            detail: detail.into(),
        }
    }

    pub fn certificate(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::CertificateRejected {
            key,
            detail: detail.into(),
        }
    }

    pub fn encryption(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::Encryption {
            key,
            detail: detail.into(),
        }
    }

    pub fn metadata(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::Metadata {
            key,
            detail: detail.into(),
        }
    }

    pub fn unavailable(key: ErrorKey, detail: impl Into<String>) -> Self {
        Self::Unavailable {
            key,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ErrorKey {
        match self {
            Self::Configuration(_) => ErrorKey::SamlEngineConfigurationError,
            Self::Marshalling(_) => ErrorKey::InvalidAttributeValue,
            Self::MissingSignature(_) => ErrorKey::InvalidCertificateSign,
            Self::UnsolicitedResponse(_) | Self::DuplicateRequestId(_) => ErrorKey::AuRequestId,
            Self::Xml(_) => ErrorKey::MessageFormatUnsupported,
            Self::Crypto(_) => ErrorKey::InternalError,
            Self::Validation { key, .. }
            | Self::InvalidSignature { key, .. }
            | Self::CertificateRejected { key, .. }
            | Self::Encryption { key, .. }
            | Self::Metadata { key, .. }
            | Self::Unavailable { key, .. } => *key,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Validation { .. } | Self::Marshalling(_) | Self::Xml(_) => {
                ErrorCategory::Validation
            }
            Self::MissingSignature(_)
            | Self::InvalidSignature { .. }
            | Self::CertificateRejected { .. }
            | Self::Encryption { .. }
            | Self::Metadata { .. } => ErrorCategory::Trust,
            Self::UnsolicitedResponse(_) | Self::DuplicateRequestId(_) => {
                ErrorCategory::Correlation
            }
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Crypto(_) => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Unavailable
    }
}

impl From<openssl::error::ErrorStack> for EngineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<base64::DecodeError> for EngineError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Xml(format!("invalid base64 content: {err}"))
    }
}

impl From<libxml::parser::XmlParseError> for EngineError {
    fn from(err: libxml::parser::XmlParseError) -> Self {
        Self::Xml(format!("{err:?}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::unavailable(ErrorKey::SamlEngineNoMetadata, err.to_string())
        } else {
            Self::metadata(ErrorKey::SamlEngineNoMetadata, err.to_string())
        }
    }
}

/// Resolved error code and message, as sent in a SAML status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescription {
    pub code: String,
    pub message: String,
}

/// Immutable lookup table from [`ErrorKey`] to the deployment's error codes
/// and messages.
///
/// Keys without an entry fall back to their property names, so a catalog
/// built from an empty property set is still usable.
#[derive(Debug, Clone, Default)]
pub struct ErrorCatalog {
    entries: HashMap<ErrorKey, ErrorDescription>,
}

impl ErrorCatalog {
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let entries = ErrorKey::ALL
            .into_iter()
            .filter_map(|key| {
                let code = properties.get(&key.error_code());
                let message = properties.get(&key.error_message());
                if code.is_none() && message.is_none() {
                    return None;
                }
                Some((
                    key,
                    ErrorDescription {
                        code: code.cloned().unwrap_or_else(|| key.error_code()),
                        message: message.cloned().unwrap_or_else(|| key.error_message()),
                    },
                ))
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn describe(&self, key: ErrorKey) -> ErrorDescription {
        self.entries
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ErrorDescription {
                code: key.error_code(),
                message: key.error_message(),
            })
    }

    #[must_use]
    pub fn describe_error(&self, error: &EngineError) -> ErrorDescription {
        self.describe(error.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_derive_property_names_from_key() {
        assert_eq!(
            ErrorKey::ColleagueRequestInvalidLoa.error_code(),
            "colleagueRequest.invalidLoA.code"
        );
        assert_eq!(
            ErrorKey::MessageValidationError.error_message(),
            "message.validation.error.message"
        );
        assert_eq!(
            ErrorKey::from_id("inconsistent.sptype"),
            Some(ErrorKey::ColleagueRequestInconsistentSpType)
        );
        assert_eq!(ErrorKey::from_id("no.such.key"), None);
    }

    #[test]
    fn can_resolve_catalog_overrides() {
        let mut properties = HashMap::new();
        properties.insert(
            "attVerification.mandatory.code".to_string(),
            "202010".to_string(),
        );
        let catalog = ErrorCatalog::from_properties(&properties);

        let mandatory = catalog.describe(ErrorKey::AttVerificationMandatory);
        assert_eq!(mandatory.code, "202010");
        assert_eq!(mandatory.message, "attVerification.mandatory.message");

        let fallback = catalog.describe(ErrorKey::InternalError);
        assert_eq!(fallback.code, "internalError.code");
    }

    #[test]
    fn can_categorise_errors() {
        assert_eq!(
            EngineError::UnsolicitedResponse("_abc".into()).category(),
            ErrorCategory::Correlation
        );
        assert_eq!(
            EngineError::validation(ErrorKey::ColleagueRequestInvalidLoa, "empty").key(),
            ErrorKey::ColleagueRequestInvalidLoa
        );
        assert!(
            EngineError::unavailable(ErrorKey::SamlEngineNoMetadata, "timeout").is_retryable()
        );
        assert!(!EngineError::MissingSignature("none".into()).is_retryable());
    }
}
