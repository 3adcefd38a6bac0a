//! Node metadata: the parameters a peer publishes, their XML form, and the
//! fetching, caching and trust rules around them.

mod cache;
mod fetcher;
mod generator;
mod parser;
mod signer;
mod whitelist;

use openssl::x509::X509;
use time::OffsetDateTime;

pub use cache::{InMemoryMetadataCache, MetadataCache};
pub use fetcher::{
    CachingMetadataFetcher, HttpMetadataFetcher, InMemoryMetadataFetcher, MetadataClock,
    MetadataFetcher, SystemClock,
};
pub use generator::generate_metadata;
pub use parser::parse_metadata;
pub use signer::{MetadataSigner, ProtocolMetadataSigner};
pub use whitelist::{MetadataWhitelist, MAX_WHITELIST_URI_LENGTH};

use crate::{
    binding::ProtocolBinding,
    error::{EngineError, EngineResult, ErrorKey},
    request::{is_country_code, SpType},
    utils::{distinct_values, is_blank},
};

pub const PROTOCOL_VERSION_URI: &str = "http://eidas.europa.eu/entity-attributes/protocol-version";
pub const APPLICATION_IDENTIFIER_URI: &str =
    "http://eidas.europa.eu/entity-attributes/application-identifier";
pub const LEVEL_OF_ASSURANCE_NAME: &str = "urn:oasis:names:tc:SAML:attribute:assurance-certification";
pub const ENTITY_CATEGORY_NAME: &str = "http://macedir.org/entity-category";
pub const REQUESTER_ID_FLAG_VALUE: &str =
    "http://eidas.europa.eu/entity-attributes/termsofaccess/requesterid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataRole {
    /// Connector side, `SPSSODescriptor`.
    Sp,
    /// Proxy-Service side, `IDPSSODescriptor`.
    Idp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Organization {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    pub company: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// What a node publishes for one of its roles.
#[derive(Debug, Clone)]
pub struct RoleParameters {
    pub role: MetadataRole,
    pub signing_certificates: Vec<X509>,
    pub encryption_certificates: Vec<X509>,
    /// Binding to endpoint location, first entry is the default binding.
    pub bindings: Vec<(ProtocolBinding, String)>,
    /// SP only.
    pub default_assertion_consumer_url: Option<String>,
    /// IDP only, attribute name URIs.
    pub supported_attributes: Vec<String>,
    pub name_id_formats: Vec<String>,
    pub want_assertions_signed: bool,
    pub authn_requests_signed: bool,
}

impl RoleParameters {
    pub fn new(role: MetadataRole) -> Self {
        Self {
            role,
            signing_certificates: Vec::new(),
            encryption_certificates: Vec::new(),
            bindings: Vec::new(),
            default_assertion_consumer_url: None,
            supported_attributes: Vec::new(),
            name_id_formats: Vec::new(),
            want_assertions_signed: true,
            authn_requests_signed: true,
        }
    }

    pub fn default_binding(&self) -> Option<ProtocolBinding> {
        self.bindings.first().map(|(binding, _)| *binding)
    }

    pub fn location(&self, binding: ProtocolBinding) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(candidate, _)| *candidate == binding)
            .map(|(_, location)| location.as_str())
    }

    pub fn supports_binding(&self, binding: ProtocolBinding) -> bool {
        self.location(binding).is_some()
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EidasMetadataParameters {
    pub entity_id: String,
    pub valid_until: Option<OffsetDateTime>,
    pub node_country: Option<String>,
    pub organization: Option<Organization>,
    pub support_contact: Option<Contact>,
    pub technical_contact: Option<Contact>,
    pub roles: Vec<RoleParameters>,
    pub digest_methods: Vec<String>,
    pub signing_methods: Vec<String>,
    pub sp_type: Option<SpType>,
    pub assurance_levels: Vec<String>,
    pub protocol_versions: Vec<String>,
    pub application_identifiers: Vec<String>,
    pub requester_id_flag: bool,
}

impl EidasMetadataParameters {
    pub fn builder() -> EidasMetadataParametersBuilder {
        EidasMetadataParametersBuilder::default()
    }

    pub fn role(&self, role: MetadataRole) -> Option<&RoleParameters> {
        self.roles.iter().find(|parameters| parameters.role == role)
    }

    pub fn signing_certificates(&self, role: MetadataRole) -> &[X509] {
        self.role(role)
            .map(|parameters| parameters.signing_certificates.as_slice())
            .unwrap_or_default()
    }

    /// First encryption certificate published for `role`.
    pub fn encryption_certificate(&self, role: MetadataRole) -> EngineResult<&X509> {
        self.role(role)
            .and_then(|parameters| parameters.encryption_certificates.first())
            .ok_or_else(|| {
                EngineError::metadata(
                    ErrorKey::SamlEngineInvalidMetadata,
                    format!("{} publishes no encryption certificate", self.entity_id),
                )
            })
    }

    pub fn supported_attributes(&self) -> &[String] {
        self.role(MetadataRole::Idp)
            .map(|parameters| parameters.supported_attributes.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct EidasMetadataParametersBuilder {
    entity_id: Option<String>,
    valid_until: Option<OffsetDateTime>,
    node_country: Option<String>,
    organization: Option<Organization>,
    support_contact: Option<Contact>,
    technical_contact: Option<Contact>,
    roles: Vec<RoleParameters>,
    digest_methods: Vec<String>,
    signing_methods: Vec<String>,
    sp_type: Option<SpType>,
    assurance_levels: Vec<String>,
    protocol_versions: Vec<String>,
    application_identifiers: Vec<String>,
    requester_id_flag: bool,
}

impl EidasMetadataParametersBuilder {
    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn valid_until(self, valid_until: OffsetDateTime) -> Self {
        Self {
            valid_until: Some(valid_until),
            ..self
        }
    }

    pub fn node_country(self, country: &str) -> Self {
        Self {
            node_country: Some(country.into()),
            ..self
        }
    }

    pub fn organization(self, organization: Organization) -> Self {
        Self {
            organization: Some(organization),
            ..self
        }
    }

    pub fn support_contact(self, contact: Contact) -> Self {
        Self {
            support_contact: Some(contact),
            ..self
        }
    }

    pub fn technical_contact(self, contact: Contact) -> Self {
        Self {
            technical_contact: Some(contact),
            ..self
        }
    }

    /// Replaces any parameters already given for the same role.
    pub fn role(mut self, parameters: RoleParameters) -> Self {
        self.roles.retain(|existing| existing.role != parameters.role);
        self.roles.push(parameters);
        self
    }

    /// `;` separated digest method URIs.
    pub fn digest_methods(self, methods: &str) -> Self {
        Self {
            digest_methods: distinct_values(methods),
            ..self
        }
    }

    /// `;` separated signing method URIs.
    pub fn signing_methods(self, methods: &str) -> Self {
        Self {
            signing_methods: distinct_values(methods),
            ..self
        }
    }

    pub fn sp_type(self, sp_type: SpType) -> Self {
        Self {
            sp_type: Some(sp_type),
            ..self
        }
    }

    pub fn assurance_levels(self, levels: Vec<String>) -> Self {
        Self {
            assurance_levels: levels,
            ..self
        }
    }

    pub fn protocol_versions(self, versions: Vec<String>) -> Self {
        Self {
            protocol_versions: versions,
            ..self
        }
    }

    pub fn application_identifiers(self, identifiers: Vec<String>) -> Self {
        Self {
            application_identifiers: identifiers,
            ..self
        }
    }

    pub fn requester_id_flag(self, requester_id_flag: bool) -> Self {
        Self {
            requester_id_flag,
            ..self
        }
    }

    pub fn build(self) -> EngineResult<EidasMetadataParameters> {
        let invalid = |detail: String| EngineError::metadata(ErrorKey::SamlEngineInvalidMetadata, detail);
        let entity_id = self
            .entity_id
            .filter(|id| !is_blank(Some(id)))
            .ok_or_else(|| invalid("entity id is required".into()))?;
        if let Some(country) = &self.node_country {
            if !is_country_code(country) {
                return Err(invalid(format!("node country {country:?} is not two upper case letters")));
            }
        }
        let dedupe = |values: Vec<String>| distinct_values(&values.join(";"));

        Ok(EidasMetadataParameters {
            entity_id,
            valid_until: self.valid_until,
            node_country: self.node_country,
            organization: self.organization,
            support_contact: self.support_contact,
            technical_contact: self.technical_contact,
            roles: self.roles,
            digest_methods: self.digest_methods,
            signing_methods: self.signing_methods,
            sp_type: self.sp_type,
            assurance_levels: dedupe(self.assurance_levels),
            protocol_versions: dedupe(self.protocol_versions),
            application_identifiers: dedupe(self.application_identifiers),
            requester_id_flag: self.requester_id_flag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_dedupe_digest_methods() {
        let parameters = EidasMetadataParameters::builder()
            .entity_id("https://proxy.be/metadata")
            .digest_methods("SHA256;SHA384;SHA512;SHA256")
            .build()
            .unwrap();
        assert_eq!(parameters.digest_methods, vec!["SHA256", "SHA384", "SHA512"]);
    }

    #[test]
    fn can_reject_bad_node_country() {
        let builder = EidasMetadataParameters::builder().entity_id("https://proxy.be/metadata");
        assert!(builder.clone().node_country("BE").build().is_ok());
        let err = builder.node_country("Belgium").build().unwrap_err();
        assert_eq!(err.key(), ErrorKey::SamlEngineInvalidMetadata);
    }

    #[test]
    fn can_look_up_role_parameters() {
        let mut sp = RoleParameters::new(MetadataRole::Sp);
        sp.bindings.push((ProtocolBinding::Post, "https://connector.be/acs".into()));
        let parameters = EidasMetadataParameters::builder()
            .entity_id("https://connector.be/metadata")
            .role(sp)
            .build()
            .unwrap();
        let role = parameters.role(MetadataRole::Sp).unwrap();
        assert_eq!(role.default_binding(), Some(ProtocolBinding::Post));
        assert!(!role.supports_binding(ProtocolBinding::Redirect));
        assert!(parameters.role(MetadataRole::Idp).is_none());
        assert!(parameters.encryption_certificate(MetadataRole::Sp).is_err());
    }
}
