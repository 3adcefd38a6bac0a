use std::{collections::HashMap, str::FromStr, time::Duration as StdDuration};

use time::Duration;
use tracing::debug;

use crate::{
    attribute::catalog::{legal, natural, representative},
    crypto::{
        DataEncryptionAlgorithm, KeyAgreementAlgorithm, KeyTransportAlgorithm, SignatureAlgorithm,
    },
    error::{EngineError, EngineResult, ErrorCatalog},
    metadata::MetadataWhitelist,
    utils::distinct_values,
};

pub const SIGNATURE_ALGORITHM: &str = "signature.algorithm";
pub const SIGNATURE_ALGORITHM_WHITELIST: &str = "signature.algorithm.whitelist";
pub const VALIDATE_SIGNATURE: &str = "validateSignature";
pub const SIGN_ASSERTIONS: &str = "response.sign.assertions";
pub const ENCRYPTION_MANDATORY: &str = "response.encryption.mandatory";
pub const DATA_ENCRYPTION_ALGORITHM: &str = "data.encryption.algorithm";
pub const ENCRYPTION_ALGORITHM_WHITELIST: &str = "encryption.algorithm.whitelist";
pub const KEY_ENCRYPTION_ALGORITHM: &str = "key.encryption.algorithm";
pub const KEY_AGREEMENT_METHOD: &str = "key.encryption.agreement.method";
pub const CHECK_CERTIFICATE_VALIDITY: &str = "check.certificate.validity.period";
pub const DISALLOW_SELF_SIGNED: &str = "disallow.self.signed.certificate";
pub const TIME_SKEW_BEFORE: &str = "response.time.skew.before";
pub const TIME_SKEW_AFTER: &str = "response.time.skew.after";
pub const ASSERTION_VALIDITY: &str = "timeNotOnOrAfter";
pub const MAX_MESSAGE_SIZE: &str = "max.message.size";
pub const METADATA_WHITELIST_USE: &str = "metadata.location.whitelist.use";
pub const METADATA_WHITELIST: &str = "metadata.location.whitelist";
pub const METADATA_RESTRICT_HTTP: &str = "metadata.restrict.http";
pub const METADATA_CHECK_SIGNATURE: &str = "metadata.check.signature";
pub const METADATA_CACHE_TTL: &str = "metadata.cache.ttl.seconds";
pub const METADATA_FETCH_TIMEOUT: &str = "metadata.fetch.timeout.seconds";
pub const METADATA_MAX_SIZE: &str = "metadata.max.size";
pub const CORRELATION_TTL: &str = "correlation.ttl.seconds";
pub const CORRELATION_MAX_ENTRIES: &str = "correlation.max.entries";
pub const ATTRIBUTE_VALIDATION_ACTIVE: &str = "attribute.validation.active";
pub const ATTRIBUTE_VALUE_MAX_LENGTH: &str = "attribute.value.max.length";
pub const MANDATORY_NATURAL: &str = "mandatory.attributes.natural";
pub const MANDATORY_LEGAL: &str = "mandatory.attributes.legal";
pub const MANDATORY_REPRESENTATIVE_NATURAL: &str = "mandatory.attributes.representative.natural";
pub const MANDATORY_REPRESENTATIVE_LEGAL: &str = "mandatory.attributes.representative.legal";
pub const MANDATORY_RULE: &str = "mandatory.attributes.rule";
pub const LOA_NON_NOTIFIED: &str = "loa.non.notified";
pub const PROTOCOL_VERSIONS: &str = "eidas.protocol.version";
pub const APPLICATION_IDENTIFIERS: &str = "eidas.application.identifier";

/// How a mandatory attribute set is satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MandatoryRule {
    /// Every attribute of the set has to be present.
    #[default]
    All,
    /// One attribute of the set is enough.
    Any,
}

impl FromStr for MandatoryRule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(EngineError::Configuration(format!(
                "{MANDATORY_RULE} must be all or any, not {other:?}"
            ))),
        }
    }
}

/// Name URIs making up the natural, legal and representative mandatory sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MandatoryAttributeSets {
    pub rule: MandatoryRule,
    pub natural: Vec<String>,
    pub legal: Vec<String>,
    pub representative_natural: Vec<String>,
    pub representative_legal: Vec<String>,
}

impl Default for MandatoryAttributeSets {
    fn default() -> Self {
        let natural = vec![
            natural::PERSON_IDENTIFIER.to_string(),
            natural::CURRENT_FAMILY_NAME.to_string(),
            natural::CURRENT_GIVEN_NAME.to_string(),
            natural::DATE_OF_BIRTH.to_string(),
        ];
        let legal = vec![
            legal::LEGAL_PERSON_IDENTIFIER.to_string(),
            legal::LEGAL_NAME.to_string(),
        ];
        let representative_natural = [
            natural::person_identifier(),
            natural::current_family_name(),
            natural::current_given_name(),
            natural::date_of_birth(),
        ]
        .iter()
        .map(|d| representative(d).name_uri().to_string())
        .collect();
        let representative_legal = [legal::legal_person_identifier(), legal::legal_name()]
            .iter()
            .map(|d| representative(d).name_uri().to_string())
            .collect();
        Self {
            rule: MandatoryRule::default(),
            natural,
            legal,
            representative_natural,
            representative_legal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub use_whitelist: bool,
    pub whitelist: MetadataWhitelist,
    pub restrict_http: bool,
    pub check_signature: bool,
    pub cache_ttl: StdDuration,
    pub fetch_timeout: StdDuration,
    /// Largest metadata document accepted from a remote location, in bytes.
    pub max_document_size: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            use_whitelist: false,
            whitelist: MetadataWhitelist::default(),
            restrict_http: true,
            check_signature: true,
            cache_ttl: StdDuration::from_secs(86_400),
            fetch_timeout: StdDuration::from_secs(10),
            max_document_size: 1_048_576,
        }
    }
}

/// Engine settings, immutable once built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub signature_algorithm: SignatureAlgorithm,
    pub signature_algorithm_whitelist: Vec<SignatureAlgorithm>,
    pub validate_signature: bool,
    pub sign_assertions: bool,
    pub encryption_mandatory: bool,
    pub data_encryption_algorithm: DataEncryptionAlgorithm,
    pub encryption_algorithm_whitelist: Vec<DataEncryptionAlgorithm>,
    pub key_transport_algorithm: KeyTransportAlgorithm,
    pub key_agreement_algorithm: KeyAgreementAlgorithm,
    pub check_certificate_validity_period: bool,
    pub disallow_self_signed_certificate: bool,
    pub time_skew_before: Duration,
    pub time_skew_after: Duration,
    pub assertion_validity: Duration,
    pub max_message_size: usize,
    pub metadata: MetadataConfig,
    pub correlation_ttl: StdDuration,
    pub correlation_max_entries: u64,
    pub attribute_validation_active: bool,
    pub attribute_value_max_length: usize,
    pub mandatory_attributes: MandatoryAttributeSets,
    pub non_notified_levels: Vec<String>,
    pub protocol_versions: Vec<String>,
    pub application_identifiers: Vec<String>,
    pub errors: ErrorCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            signature_algorithm_whitelist: SignatureAlgorithm::ALL.to_vec(),
            validate_signature: true,
            sign_assertions: true,
            encryption_mandatory: true,
            data_encryption_algorithm: DataEncryptionAlgorithm::Aes256Gcm,
            encryption_algorithm_whitelist: DataEncryptionAlgorithm::ALL.to_vec(),
            key_transport_algorithm: KeyTransportAlgorithm::RsaOaep,
            key_agreement_algorithm: KeyAgreementAlgorithm::EcdhEs,
            check_certificate_validity_period: true,
            disallow_self_signed_certificate: false,
            time_skew_before: Duration::ZERO,
            time_skew_after: Duration::ZERO,
            assertion_validity: Duration::seconds(300),
            max_message_size: 131_072,
            metadata: MetadataConfig::default(),
            correlation_ttl: StdDuration::from_secs(300),
            correlation_max_entries: 100_000,
            attribute_validation_active: true,
            attribute_value_max_length: 20_000,
            mandatory_attributes: MandatoryAttributeSets::default(),
            non_notified_levels: Vec::new(),
            protocol_versions: vec!["1.3".into(), "1.2".into(), "1.1".into()],
            application_identifiers: Vec::new(),
            errors: ErrorCatalog::default(),
        }
    }
}

struct Properties<'a>(&'a HashMap<String, String>);

impl Properties<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> EngineResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                EngineError::Configuration(format!("invalid value {value:?} for {key}"))
            }),
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(distinct_values)
    }

    fn parse_list<T: FromStr>(&self, key: &str, default: Vec<T>) -> EngineResult<Vec<T>> {
        match self.list(key) {
            None => Ok(default),
            Some(values) => values.iter().map(|value| self.parse_one(key, value)).collect(),
        }
    }

    fn parse_one<T: FromStr>(&self, key: &str, value: &str) -> EngineResult<T> {
        value
            .parse()
            .map_err(|_| EngineError::Configuration(format!("invalid value {value:?} for {key}")))
    }

    fn seconds(&self, key: &str, default: i64) -> EngineResult<Duration> {
        let seconds: i64 = self.parse(key, default)?;
        if seconds < 0 {
            return Err(EngineError::Configuration(format!("{key} cannot be negative")));
        }
        Ok(Duration::seconds(seconds))
    }

    fn std_seconds(&self, key: &str, default: u64) -> EngineResult<StdDuration> {
        Ok(StdDuration::from_secs(self.parse(key, default)?))
    }
}

impl EngineConfig {
    /// Reads the configuration from named properties. Absent keys keep their
    /// defaults, malformed values are configuration errors.
    pub fn from_properties(properties: &HashMap<String, String>) -> EngineResult<Self> {
        let props = Properties(properties);
        let defaults = Self::default();
        let default_sets = MandatoryAttributeSets::default();

        let signature_algorithm: SignatureAlgorithm = match props.get(SIGNATURE_ALGORITHM) {
            None => defaults.signature_algorithm,
            Some(value) => props.parse_one(SIGNATURE_ALGORITHM, value)?,
        };
        let signature_algorithm_whitelist =
            props.parse_list(SIGNATURE_ALGORITHM_WHITELIST, defaults.signature_algorithm_whitelist)?;
        if !signature_algorithm_whitelist.contains(&signature_algorithm) {
            return Err(EngineError::Configuration(format!(
                "{SIGNATURE_ALGORITHM} {signature_algorithm} is not in {SIGNATURE_ALGORITHM_WHITELIST}"
            )));
        }

        let data_encryption_algorithm = match props.get(DATA_ENCRYPTION_ALGORITHM) {
            None => defaults.data_encryption_algorithm,
            Some(value) => props.parse_one(DATA_ENCRYPTION_ALGORITHM, value)?,
        };
        let key_transport_algorithm = match props.get(KEY_ENCRYPTION_ALGORITHM) {
            None => defaults.key_transport_algorithm,
            Some(value) => props.parse_one(KEY_ENCRYPTION_ALGORITHM, value)?,
        };
        let key_agreement_algorithm = match props.get(KEY_AGREEMENT_METHOD) {
            None => defaults.key_agreement_algorithm,
            Some(value) => props.parse_one(KEY_AGREEMENT_METHOD, value)?,
        };

        let use_whitelist = props.parse(METADATA_WHITELIST_USE, false)?;
        let whitelist = props
            .get(METADATA_WHITELIST)
            .map(MetadataWhitelist::parse)
            .unwrap_or_default();

        let config = Self {
            signature_algorithm,
            signature_algorithm_whitelist,
            validate_signature: props.parse(VALIDATE_SIGNATURE, defaults.validate_signature)?,
            sign_assertions: props.parse(SIGN_ASSERTIONS, defaults.sign_assertions)?,
            encryption_mandatory: props
                .parse(ENCRYPTION_MANDATORY, defaults.encryption_mandatory)?,
            data_encryption_algorithm,
            encryption_algorithm_whitelist: props.parse_list(
                ENCRYPTION_ALGORITHM_WHITELIST,
                defaults.encryption_algorithm_whitelist,
            )?,
            key_transport_algorithm,
            key_agreement_algorithm,
            check_certificate_validity_period: props.parse(
                CHECK_CERTIFICATE_VALIDITY,
                defaults.check_certificate_validity_period,
            )?,
            disallow_self_signed_certificate: props
                .parse(DISALLOW_SELF_SIGNED, defaults.disallow_self_signed_certificate)?,
            time_skew_before: props.seconds(TIME_SKEW_BEFORE, 0)?,
            time_skew_after: props.seconds(TIME_SKEW_AFTER, 0)?,
            assertion_validity: props.seconds(ASSERTION_VALIDITY, 300)?,
            max_message_size: props.parse(MAX_MESSAGE_SIZE, defaults.max_message_size)?,
            metadata: MetadataConfig {
                use_whitelist,
                whitelist,
                restrict_http: props
                    .parse(METADATA_RESTRICT_HTTP, defaults.metadata.restrict_http)?,
                check_signature: props
                    .parse(METADATA_CHECK_SIGNATURE, defaults.metadata.check_signature)?,
                cache_ttl: props.std_seconds(METADATA_CACHE_TTL, 86_400)?,
                fetch_timeout: props.std_seconds(METADATA_FETCH_TIMEOUT, 10)?,
                max_document_size: props
                    .parse(METADATA_MAX_SIZE, defaults.metadata.max_document_size)?,
            },
            correlation_ttl: props.std_seconds(CORRELATION_TTL, 300)?,
            correlation_max_entries: props
                .parse(CORRELATION_MAX_ENTRIES, defaults.correlation_max_entries)?,
            attribute_validation_active: props.parse(
                ATTRIBUTE_VALIDATION_ACTIVE,
                defaults.attribute_validation_active,
            )?,
            attribute_value_max_length: props
                .parse(ATTRIBUTE_VALUE_MAX_LENGTH, defaults.attribute_value_max_length)?,
            mandatory_attributes: MandatoryAttributeSets {
                rule: props.parse(MANDATORY_RULE, default_sets.rule)?,
                natural: props.list(MANDATORY_NATURAL).unwrap_or(default_sets.natural),
                legal: props.list(MANDATORY_LEGAL).unwrap_or(default_sets.legal),
                representative_natural: props
                    .list(MANDATORY_REPRESENTATIVE_NATURAL)
                    .unwrap_or(default_sets.representative_natural),
                representative_legal: props
                    .list(MANDATORY_REPRESENTATIVE_LEGAL)
                    .unwrap_or(default_sets.representative_legal),
            },
            non_notified_levels: props.list(LOA_NON_NOTIFIED).unwrap_or_default(),
            protocol_versions: props
                .list(PROTOCOL_VERSIONS)
                .unwrap_or(defaults.protocol_versions),
            application_identifiers: props.list(APPLICATION_IDENTIFIERS).unwrap_or_default(),
            errors: ErrorCatalog::from_properties(properties),
        };
        if config.max_message_size == 0 {
            return Err(EngineError::Configuration(format!("{MAX_MESSAGE_SIZE} must be positive")));
        }
        debug!(
            signature_algorithm = %config.signature_algorithm,
            whitelist_in_use = config.metadata.use_whitelist,
            "engine configuration loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn can_load_defaults() {
        let config = EngineConfig::from_properties(&HashMap::new()).unwrap();
        assert_eq!(config.signature_algorithm, SignatureAlgorithm::RsaSha256);
        assert_eq!(config.assertion_validity, Duration::seconds(300));
        assert_eq!(config.mandatory_attributes.rule, MandatoryRule::All);
        assert_eq!(config.mandatory_attributes.natural.len(), 4);
        assert!(!config.metadata.use_whitelist);
        assert_eq!(config.protocol_versions, vec!["1.3", "1.2", "1.1"]);
    }

    #[test]
    fn can_read_named_keys() {
        let config = EngineConfig::from_properties(&properties(&[
            (METADATA_WHITELIST_USE, "true"),
            (METADATA_WHITELIST, "http://Europa.eu;mickey://mouse.com"),
            (TIME_SKEW_BEFORE, "30"),
            (MANDATORY_RULE, "any"),
            (
                MANDATORY_NATURAL,
                "http://eidas.europa.eu/attributes/naturalperson/PersonIdentifier;http://eidas.europa.eu/attributes/naturalperson/Gender",
            ),
            (
                DATA_ENCRYPTION_ALGORITHM,
                "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            ),
        ]))
        .unwrap();
        assert!(config.metadata.use_whitelist);
        assert_eq!(config.metadata.whitelist.len(), 2);
        assert_eq!(config.time_skew_before, Duration::seconds(30));
        assert_eq!(config.mandatory_attributes.rule, MandatoryRule::Any);
        assert_eq!(config.mandatory_attributes.natural.len(), 2);
        assert_eq!(
            config.data_encryption_algorithm,
            DataEncryptionAlgorithm::Aes128Gcm
        );
    }

    #[test]
    fn can_reject_malformed_values() {
        for (key, value) in [
            (VALIDATE_SIGNATURE, "maybe"),
            (TIME_SKEW_AFTER, "-5"),
            (SIGNATURE_ALGORITHM, "urn:unknown"),
            (MANDATORY_RULE, "some"),
            (MAX_MESSAGE_SIZE, "0"),
        ] {
            let result = EngineConfig::from_properties(&properties(&[(key, value)]));
            assert!(
                matches!(result, Err(EngineError::Configuration(_))),
                "{key}={value} accepted"
            );
        }
    }

    #[test]
    fn can_require_signature_algorithm_in_whitelist() {
        let result = EngineConfig::from_properties(&properties(&[
            (
                SIGNATURE_ALGORITHM,
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            ),
            (
                SIGNATURE_ALGORITHM_WHITELIST,
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            ),
        ]));
        assert!(result.is_err());
    }
}
