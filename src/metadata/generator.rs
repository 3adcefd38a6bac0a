use base64::{prelude::BASE64_STANDARD, Engine};
use openssl::x509::X509;
use tracing::debug;
use yaserde::YaSerialize;

use super::{
    Contact, EidasMetadataParameters, MetadataRole, MetadataSigner, RoleParameters,
    APPLICATION_IDENTIFIER_URI, ENTITY_CATEGORY_NAME, LEVEL_OF_ASSURANCE_NAME,
    PROTOCOL_VERSION_URI, REQUESTER_ID_FLAG_VALUE,
};
use crate::{
    attribute::NAME_FORMAT_URI,
    error::{EngineError, EngineResult},
    ns,
    utils::{format_instant, generate_ncname},
};

const PROTOCOL_SUPPORT: &str = "urn:oasis:names:tc:SAML:2.0:protocol";

#[derive(YaSerialize)]
#[yaserde(
  rename = "EntityDescriptor",
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
    "saml2" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "mdattr" = "urn:oasis:names:tc:SAML:metadata:attribute",
    "alg" = "urn:oasis:names:tc:SAML:metadata:algsupport",
    "eidas" = "http://eidas.europa.eu/saml-extensions",
    "xsi" = "http://www.w3.org/2001/XMLSchema-instance",
    "xs" = "http://www.w3.org/2001/XMLSchema",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(attribute = true, rename = "validUntil")]
    valid_until: Option<String>,
    #[yaserde(rename = "Extensions", prefix = "md")]
    extensions: EntityExtensions,
    #[yaserde(rename = "IDPSSODescriptor", prefix = "md")]
    idp_sso_descriptor: Option<IdpSsoDescriptor>,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: Option<SpSsoDescriptor>,
    #[yaserde(rename = "Organization", prefix = "md")]
    organization: Option<OrganizationElement>,
    #[yaserde(rename = "ContactPerson", prefix = "md")]
    contact_persons: Vec<ContactPerson>,
}

#[derive(YaSerialize)]
struct EntityExtensions {
    #[yaserde(rename = "EntityAttributes", prefix = "mdattr")]
    entity_attributes: Option<EntityAttributes>,
    #[yaserde(rename = "SPType", prefix = "eidas")]
    sp_type: Option<TextElement>,
    #[yaserde(rename = "DigestMethod", prefix = "alg")]
    digest_methods: Vec<AlgorithmElement>,
    #[yaserde(rename = "SigningMethod", prefix = "alg")]
    signing_methods: Vec<AlgorithmElement>,
}

#[derive(YaSerialize)]
struct EntityAttributes {
    #[yaserde(rename = "Attribute", prefix = "saml2")]
    attributes: Vec<EntityAttribute>,
}

#[derive(YaSerialize)]
struct EntityAttribute {
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(attribute = true, rename = "NameFormat")]
    name_format: String,
    #[yaserde(rename = "AttributeValue", prefix = "saml2")]
    values: Vec<TypedValue>,
}

#[derive(YaSerialize)]
struct TypedValue {
    #[yaserde(attribute = true, prefix = "xsi", rename = "type")]
    xsi_type: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct TextElement {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct AlgorithmElement {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
}

#[derive(YaSerialize)]
struct RoleExtensions {
    #[yaserde(rename = "NodeCountry", prefix = "eidas")]
    node_country: TextElement,
}

#[derive(YaSerialize)]
struct IdpSsoDescriptor {
    #[yaserde(attribute = true, rename = "WantAuthnRequestsSigned")]
    want_authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "Extensions", prefix = "md")]
    extensions: Option<RoleExtensions>,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptors: Vec<KeyDescriptor>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_formats: Vec<TextElement>,
    #[yaserde(rename = "SingleSignOnService", prefix = "md")]
    single_sign_on_services: Vec<Endpoint>,
    #[yaserde(rename = "Attribute", prefix = "saml2")]
    attributes: Vec<SupportedAttribute>,
}

#[derive(YaSerialize)]
struct SpSsoDescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "Extensions", prefix = "md")]
    extensions: Option<RoleExtensions>,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptors: Vec<KeyDescriptor>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_formats: Vec<TextElement>,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_services: Vec<IndexedEndpoint>,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    certificate: TextElement,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

#[derive(YaSerialize)]
struct IndexedEndpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: bool,
}

#[derive(YaSerialize)]
struct SupportedAttribute {
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(attribute = true, rename = "NameFormat")]
    name_format: String,
}

#[derive(YaSerialize)]
struct OrganizationElement {
    #[yaserde(rename = "OrganizationName", prefix = "md")]
    name: TextElement,
    #[yaserde(rename = "OrganizationDisplayName", prefix = "md")]
    display_name: TextElement,
    #[yaserde(rename = "OrganizationURL", prefix = "md")]
    url: TextElement,
}

#[derive(YaSerialize)]
struct ContactPerson {
    #[yaserde(attribute = true, rename = "contactType")]
    contact_type: String,
    #[yaserde(rename = "Company", prefix = "md")]
    company: Option<TextElement>,
    #[yaserde(rename = "GivenName", prefix = "md")]
    given_name: Option<TextElement>,
    #[yaserde(rename = "SurName", prefix = "md")]
    surname: Option<TextElement>,
    #[yaserde(rename = "EmailAddress", prefix = "md")]
    email: Option<TextElement>,
    #[yaserde(rename = "TelephoneNumber", prefix = "md")]
    phone: Option<TextElement>,
}

fn text(content: &str) -> TextElement {
    TextElement {
        content: content.into(),
    }
}

fn string_values(values: &[String]) -> Vec<TypedValue> {
    values
        .iter()
        .map(|value| TypedValue {
            xsi_type: "xs:string".into(),
            content: value.clone(),
        })
        .collect()
}

fn entity_attribute(name: &str, values: &[String]) -> Option<EntityAttribute> {
    (!values.is_empty()).then(|| EntityAttribute {
        name: name.into(),
        name_format: NAME_FORMAT_URI.into(),
        values: string_values(values),
    })
}

fn key_descriptors(role: &RoleParameters) -> EngineResult<Vec<KeyDescriptor>> {
    let descriptor = |key_use: &str, certificate: &X509| -> EngineResult<KeyDescriptor> {
        Ok(KeyDescriptor {
            key_use: key_use.into(),
            key_info: KeyInfo {
                x509_data: X509Data {
                    certificate: text(&BASE64_STANDARD.encode(certificate.to_der()?)),
                },
            },
        })
    };
    let signing = role
        .signing_certificates
        .iter()
        .map(|certificate| descriptor("signing", certificate));
    let encryption = role
        .encryption_certificates
        .iter()
        .map(|certificate| descriptor("encryption", certificate));
    signing.chain(encryption).collect()
}

fn contact(contact_type: &str, contact: &Contact) -> ContactPerson {
    let optional = |value: &Option<String>| value.as_deref().map(text);
    ContactPerson {
        contact_type: contact_type.into(),
        company: optional(&contact.company),
        given_name: optional(&contact.given_name),
        surname: optional(&contact.surname),
        email: optional(&contact.email),
        phone: optional(&contact.phone),
    }
}

fn entity_descriptor(parameters: &EidasMetadataParameters, id: &str) -> EngineResult<EntityDescriptor> {
    let requester_id = parameters
        .requester_id_flag
        .then(|| vec![REQUESTER_ID_FLAG_VALUE.to_string()])
        .unwrap_or_default();
    let attributes: Vec<EntityAttribute> = [
        entity_attribute(LEVEL_OF_ASSURANCE_NAME, &parameters.assurance_levels),
        entity_attribute(PROTOCOL_VERSION_URI, &parameters.protocol_versions),
        entity_attribute(APPLICATION_IDENTIFIER_URI, &parameters.application_identifiers),
        entity_attribute(ENTITY_CATEGORY_NAME, &requester_id),
    ]
    .into_iter()
    .flatten()
    .collect();
    let algorithms = |methods: &[String]| {
        methods
            .iter()
            .map(|algorithm| AlgorithmElement {
                algorithm: algorithm.clone(),
            })
            .collect()
    };
    let role_extensions = || {
        parameters.node_country.as_deref().map(|country| RoleExtensions {
            node_country: text(country),
        })
    };
    let name_id_formats = |role: &RoleParameters| role.name_id_formats.iter().map(|f| text(f)).collect();

    let idp_sso_descriptor = match parameters.role(MetadataRole::Idp) {
        None => None,
        Some(role) => Some(IdpSsoDescriptor {
            want_authn_requests_signed: role.authn_requests_signed,
            protocol_support_enumeration: PROTOCOL_SUPPORT.into(),
            extensions: role_extensions(),
            key_descriptors: key_descriptors(role)?,
            name_id_formats: name_id_formats(role),
            single_sign_on_services: role
                .bindings
                .iter()
                .map(|(binding, location)| Endpoint {
                    binding: binding.to_string(),
                    location: location.clone(),
                })
                .collect(),
            attributes: role
                .supported_attributes
                .iter()
                .map(|name| SupportedAttribute {
                    name: name.clone(),
                    name_format: NAME_FORMAT_URI.into(),
                })
                .collect(),
        }),
    };

    let sp_sso_descriptor = match parameters.role(MetadataRole::Sp) {
        None => None,
        Some(role) => {
            let default_url = role.default_assertion_consumer_url.as_deref();
            Some(SpSsoDescriptor {
                authn_requests_signed: role.authn_requests_signed,
                want_assertions_signed: role.want_assertions_signed,
                protocol_support_enumeration: PROTOCOL_SUPPORT.into(),
                extensions: role_extensions(),
                key_descriptors: key_descriptors(role)?,
                name_id_formats: name_id_formats(role),
                assertion_consumer_services: role
                    .bindings
                    .iter()
                    .zip(0..)
                    .map(|((binding, location), index)| IndexedEndpoint {
                        binding: binding.to_string(),
                        location: location.clone(),
                        index,
                        is_default: default_url.map_or(index == 0, |url| url == location),
                    })
                    .collect(),
            })
        }
    };

    let contact_persons = [
        ("support", &parameters.support_contact),
        ("technical", &parameters.technical_contact),
    ]
    .into_iter()
    .filter_map(|(contact_type, value)| value.as_ref().map(|c| contact(contact_type, c)))
    .collect();

    Ok(EntityDescriptor {
        id: id.into(),
        entity_id: parameters.entity_id.clone(),
        valid_until: parameters.valid_until.map(format_instant),
        extensions: EntityExtensions {
            entity_attributes: (!attributes.is_empty()).then_some(EntityAttributes { attributes }),
            sp_type: parameters.sp_type.map(|sp_type| text(sp_type.value())),
            digest_methods: algorithms(&parameters.digest_methods),
            signing_methods: algorithms(&parameters.signing_methods),
        },
        idp_sso_descriptor,
        sp_sso_descriptor,
        organization: parameters.organization.as_ref().map(|organization| OrganizationElement {
            name: text(&organization.name),
            display_name: text(&organization.display_name),
            url: text(&organization.url),
        }),
        contact_persons,
    })
}

/// Serialises `parameters` as an `md:EntityDescriptor` signed by `signer`.
pub fn generate_metadata(
    parameters: &EidasMetadataParameters,
    signer: &dyn MetadataSigner,
) -> EngineResult<String> {
    let id = generate_ncname();
    let descriptor = entity_descriptor(parameters, &id)?;
    let xml = yaserde::ser::to_string(&descriptor).map_err(EngineError::Xml)?;
    debug!(entity_id = %parameters.entity_id, "metadata generated");
    signer.sign_metadata(&xml, &id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::ProtocolBinding,
        crypto::{test_support::rsa_credential, CertificateValidator, ProtocolSigner, SignatureAlgorithm},
        metadata::{parse_metadata, Organization, ProtocolMetadataSigner},
        request::SpType,
    };

    fn signer() -> ProtocolMetadataSigner {
        let credential = rsa_credential("metadata.be");
        let trusted = vec![credential.certificate().clone()];
        let signer = ProtocolSigner::new(
            credential,
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::ALL.to_vec(),
            CertificateValidator::default(),
        )
        .unwrap();
        ProtocolMetadataSigner::new(signer, trusted)
    }

    #[test]
    fn can_generate_connector_metadata() {
        let credential = rsa_credential("connector.be");
        let mut sp = RoleParameters::new(MetadataRole::Sp);
        sp.signing_certificates.push(credential.certificate().clone());
        sp.encryption_certificates.push(credential.certificate().clone());
        sp.bindings.push((ProtocolBinding::Post, "https://connector.be/acs".into()));
        sp.default_assertion_consumer_url = Some("https://connector.be/acs".into());

        let parameters = EidasMetadataParameters::builder()
            .entity_id("https://connector.be/metadata")
            .node_country("BE")
            .sp_type(SpType::Public)
            .digest_methods("http://www.w3.org/2001/04/xmlenc#sha256;http://www.w3.org/2001/04/xmlenc#sha512;http://www.w3.org/2001/04/xmlenc#sha256")
            .protocol_versions(vec!["1.2".into(), "1.1".into()])
            .requester_id_flag(true)
            .organization(Organization {
                name: "Connector".into(),
                display_name: "Belgian Connector".into(),
                url: "https://connector.be".into(),
            })
            .role(sp)
            .build()
            .unwrap();

        let signer = signer();
        let xml = generate_metadata(&parameters, &signer).unwrap();
        assert_eq!(xml.matches("alg:DigestMethod").count(), 2);
        assert!(xml.contains("<eidas:SPType>public</eidas:SPType>"));
        signer.validate_metadata_signature(&xml).unwrap();

        let parsed = parse_metadata(xml.as_bytes()).unwrap();
        assert_eq!(parsed.entity_id, "https://connector.be/metadata");
        assert_eq!(parsed.node_country.as_deref(), Some("BE"));
        assert_eq!(parsed.protocol_versions, vec!["1.2", "1.1"]);
        assert!(parsed.requester_id_flag);
        let sp = parsed.role(MetadataRole::Sp).unwrap();
        assert_eq!(sp.default_assertion_consumer_url.as_deref(), Some("https://connector.be/acs"));
        assert_eq!(sp.encryption_certificates.len(), 1);
    }
}
