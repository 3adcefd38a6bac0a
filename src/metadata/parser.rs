use libxml::{tree::Node, xpath::Context};
use openssl::x509::X509;
use tracing::warn;

use super::{
    Contact, EidasMetadataParameters, MetadataRole, Organization, RoleParameters,
    APPLICATION_IDENTIFIER_URI, ENTITY_CATEGORY_NAME, LEVEL_OF_ASSURANCE_NAME,
    PROTOCOL_VERSION_URI, REQUESTER_ID_FLAG_VALUE,
};
use crate::{
    binding::ProtocolBinding,
    crypto::certificate_from_base64,
    error::{EngineError, EngineResult, ErrorKey},
    utils::{find_nodes, find_value, parse_document, parse_instant, xpath_context},
};

fn invalid(detail: impl Into<String>) -> EngineError {
    EngineError::metadata(ErrorKey::SamlEngineInvalidMetadata, detail)
}

fn entity_attribute_values(context: &mut Context, name: &str) -> Vec<String> {
    let xpath = format!(
        "/md:EntityDescriptor/md:Extensions/mdattr:EntityAttributes/saml2:Attribute[@Name='{name}']/saml2:AttributeValue"
    );
    find_nodes(context, &xpath, None)
        .iter()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn certificates(context: &mut Context, descriptor: &Node, key_use: &str) -> EngineResult<Vec<X509>> {
    // a KeyDescriptor without `use` serves both purposes
    let xpath = format!(
        "md:KeyDescriptor[@use='{key_use}' or not(@use)]/ds:KeyInfo/ds:X509Data/ds:X509Certificate"
    );
    find_nodes(context, &xpath, Some(descriptor))
        .iter()
        .map(|node| certificate_from_base64(&node.get_content()))
        .collect()
}

fn endpoints(context: &mut Context, descriptor: &Node, element: &str) -> Vec<(ProtocolBinding, String, bool)> {
    let mut endpoints = Vec::new();
    for node in find_nodes(context, &format!("md:{element}"), Some(descriptor)) {
        let (Some(binding), Some(location)) = (node.get_attribute("Binding"), node.get_attribute("Location"))
        else {
            continue;
        };
        match binding.parse::<ProtocolBinding>() {
            Ok(binding) => {
                let is_default = node.get_attribute("isDefault").as_deref() == Some("true");
                endpoints.push((binding, location, is_default));
            }
            Err(_) => warn!(%binding, element, "unsupported metadata binding ignored"),
        }
    }
    endpoints
}

fn role(context: &mut Context, descriptor: &Node, role: MetadataRole) -> EngineResult<RoleParameters> {
    let mut parameters = RoleParameters::new(role);
    parameters.signing_certificates = certificates(context, descriptor, "signing")?;
    parameters.encryption_certificates = certificates(context, descriptor, "encryption")?;
    parameters.name_id_formats = find_nodes(context, "md:NameIDFormat", Some(descriptor))
        .iter()
        .map(|node| node.get_content().trim().to_string())
        .collect();
    let flag = |name: &str| descriptor.get_attribute(name).map(|value| value == "true");

    match role {
        MetadataRole::Idp => {
            for (binding, location, _) in endpoints(context, descriptor, "SingleSignOnService") {
                parameters.bindings.push((binding, location));
            }
            parameters.supported_attributes = find_nodes(context, "saml2:Attribute", Some(descriptor))
                .iter()
                .filter_map(|node| node.get_attribute("Name"))
                .collect();
            parameters.authn_requests_signed = flag("WantAuthnRequestsSigned").unwrap_or(true);
        }
        MetadataRole::Sp => {
            for (binding, location, is_default) in endpoints(context, descriptor, "AssertionConsumerService") {
                if is_default || parameters.default_assertion_consumer_url.is_none() {
                    parameters.default_assertion_consumer_url = Some(location.clone());
                }
                parameters.bindings.push((binding, location));
            }
            parameters.authn_requests_signed = flag("AuthnRequestsSigned").unwrap_or(true);
            parameters.want_assertions_signed = flag("WantAssertionsSigned").unwrap_or(true);
        }
    }
    Ok(parameters)
}

fn contact(context: &mut Context, contact_type: &str) -> Option<Contact> {
    let node = find_nodes(
        context,
        &format!("/md:EntityDescriptor/md:ContactPerson[@contactType='{contact_type}']"),
        None,
    )
    .into_iter()
    .next()?;
    let mut value = |element: &str| find_value(context, &format!("md:{element}"), Some(&node));
    Some(Contact {
        company: value("Company"),
        given_name: value("GivenName"),
        surname: value("SurName"),
        email: value("EmailAddress"),
        phone: value("TelephoneNumber"),
    })
}

/// Reads an `md:EntityDescriptor` into metadata parameters. The signature is
/// not checked here.
pub fn parse_metadata(input: &[u8]) -> EngineResult<EidasMetadataParameters> {
    let document = parse_document(input).map_err(|e| invalid(format!("unreadable metadata: {e}")))?;
    let mut context = xpath_context(&document)?;

    let entity_id = find_value(&mut context, "/md:EntityDescriptor/@entityID", None)
        .ok_or_else(|| invalid("metadata has no entityID"))?;
    let valid_until = find_value(&mut context, "/md:EntityDescriptor/@validUntil", None)
        .map(|value| parse_instant(&value))
        .transpose()
        .map_err(|e| invalid(format!("{entity_id}: {e}")))?;

    let mut builder = EidasMetadataParameters::builder()
        .entity_id(&entity_id)
        .assurance_levels(entity_attribute_values(&mut context, LEVEL_OF_ASSURANCE_NAME))
        .protocol_versions(entity_attribute_values(&mut context, PROTOCOL_VERSION_URI))
        .application_identifiers(entity_attribute_values(&mut context, APPLICATION_IDENTIFIER_URI))
        .requester_id_flag(
            entity_attribute_values(&mut context, ENTITY_CATEGORY_NAME)
                .iter()
                .any(|value| value == REQUESTER_ID_FLAG_VALUE),
        );
    if let Some(valid_until) = valid_until {
        builder = builder.valid_until(valid_until);
    }

    let algorithms = |context: &mut Context, element: &str| {
        find_nodes(context, &format!("/md:EntityDescriptor/md:Extensions/alg:{element}"), None)
            .iter()
            .filter_map(|node| node.get_attribute("Algorithm"))
            .collect::<Vec<_>>()
            .join(";")
    };
    builder = builder
        .digest_methods(&algorithms(&mut context, "DigestMethod"))
        .signing_methods(&algorithms(&mut context, "SigningMethod"));

    if let Some(sp_type) = find_value(&mut context, "/md:EntityDescriptor/md:Extensions/eidas:SPType", None) {
        builder = builder.sp_type(sp_type.parse()?);
    }
    if let Some(country) = find_value(
        &mut context,
        "/md:EntityDescriptor/*/md:Extensions/eidas:NodeCountry",
        None,
    ) {
        builder = builder.node_country(&country);
    }

    for (element, metadata_role) in [("IDPSSODescriptor", MetadataRole::Idp), ("SPSSODescriptor", MetadataRole::Sp)] {
        let descriptor = find_nodes(&mut context, &format!("/md:EntityDescriptor/md:{element}"), None)
            .into_iter()
            .next();
        if let Some(descriptor) = descriptor {
            builder = builder.role(role(&mut context, &descriptor, metadata_role)?);
        }
    }

    let organization = (
        find_value(&mut context, "/md:EntityDescriptor/md:Organization/md:OrganizationName", None),
        find_value(&mut context, "/md:EntityDescriptor/md:Organization/md:OrganizationDisplayName", None),
        find_value(&mut context, "/md:EntityDescriptor/md:Organization/md:OrganizationURL", None),
    );
    if let (Some(name), display_name, url) = organization {
        builder = builder.organization(Organization {
            name,
            display_name: display_name.unwrap_or_default(),
            url: url.unwrap_or_default(),
        });
    }
    if let Some(support) = contact(&mut context, "support") {
        builder = builder.support_contact(support);
    }
    if let Some(technical) = contact(&mut context, "technical") {
        builder = builder.technical_contact(technical);
    }

    builder.build()
}
