//! Reading AuthnRequest, Response and Assertion messages back into the model.

use libxml::{tree::Node, xpath::Context};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    attribute::{
        AttributeRegistry, AttributeValue, AttributeValueValidator, ImmutableAttributeMap,
        NAME_FORMAT_URI,
    },
    binding::ProtocolBinding,
    error::{EngineError, EngineResult, ErrorKey},
    loa::{LevelOfAssurance, LevelOfAssuranceComparison},
    request::EidasAuthenticationRequest,
    response::{AuthorizationDecision, ResponseStatus},
    utils::{find_nodes, find_value, parse_document, parse_instant, standalone_element, xpath_context},
};

/// The assertion of a response, still as XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionPayload {
    Plain(String),
    Encrypted(String),
}

/// The protocol level content of a Response. Nothing in it is trusted until
/// the signature has been checked.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub id: String,
    pub issuer: String,
    pub in_response_to: String,
    pub destination: Option<String>,
    pub issue_instant: Option<OffsetDateTime>,
    pub status: ResponseStatus,
    pub assertion: Option<AssertionPayload>,
}

#[derive(Debug, Clone)]
pub struct AssertionData {
    pub id: String,
    pub issuer: String,
    pub subject: String,
    pub subject_name_id_format: Option<String>,
    pub confirmation_address: Option<String>,
    pub confirmation_in_response_to: Option<String>,
    pub confirmation_not_on_or_after: Option<OffsetDateTime>,
    pub recipient: Option<String>,
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub audience: Option<String>,
    pub level_of_assurance: Option<String>,
    pub locality_address: Option<String>,
    pub attributes: ImmutableAttributeMap,
    pub authorization_decision: Option<AuthorizationDecision>,
}

fn invalid(key: ErrorKey, detail: impl Into<String>) -> EngineError {
    EngineError::validation(key, detail)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Issuers are entity ids, which eIDAS requires to be the metadata URL.
fn issuer(context: &mut Context, xpath: &str, key: ErrorKey) -> EngineResult<String> {
    let issuer = find_value(context, xpath, None).ok_or_else(|| invalid(key, "message has no issuer"))?;
    if !is_http_url(&issuer) {
        return Err(invalid(key, format!("issuer {issuer} is not an http(s) URL")));
    }
    Ok(issuer)
}

fn instant(context: &mut Context, xpath: &str, key: ErrorKey) -> EngineResult<Option<OffsetDateTime>> {
    find_value(context, xpath, None)
        .map(|value| parse_instant(&value))
        .transpose()
        .map_err(|e| invalid(key, e.to_string()))
}

fn attribute_values(
    context: &mut Context,
    node: &Node,
    value_element: &str,
    definition: &crate::attribute::AttributeDefinition,
    validator: &AttributeValueValidator,
) -> EngineResult<Vec<AttributeValue>> {
    let mut values = Vec::new();
    for value_node in find_nodes(context, value_element, Some(node)) {
        let text = value_node.get_content();
        if text.trim().is_empty() {
            return Err(invalid(
                ErrorKey::InvalidAttributeValue,
                format!("{} has an empty value", definition.name_uri()),
            ));
        }
        let non_latin = value_node.get_attribute("LatinScript").as_deref() == Some("false");
        let value = definition
            .marshaller()
            .unmarshal(&text, non_latin)
            .map_err(|e| invalid(ErrorKey::InvalidAttributeValue, format!("{}: {e}", definition.name_uri())))?;
        if !validator.is_valid(definition, &text) {
            return Err(invalid(
                ErrorKey::InvalidAttributeValue,
                format!("{} value fails validation", definition.name_uri()),
            ));
        }
        values.push(value);
    }
    Ok(values)
}

/// Reads an eIDAS AuthnRequest. Representative attributes cannot be
/// requested.
pub fn parse_authn_request(
    input: &[u8],
    registry: &AttributeRegistry,
    validator: &AttributeValueValidator,
    citizen_country_code: &str,
) -> EngineResult<EidasAuthenticationRequest> {
    const KEY: ErrorKey = ErrorKey::ColleagueRequestInvalidSaml;
    let document = parse_document(input).map_err(|e| invalid(KEY, e.to_string()))?;
    let mut context = xpath_context(&document)?;
    if find_nodes(&mut context, "/saml2p:AuthnRequest", None).is_empty() {
        return Err(invalid(KEY, "not an AuthnRequest"));
    }

    let id = find_value(&mut context, "/saml2p:AuthnRequest/@ID", None)
        .ok_or_else(|| invalid(KEY, "request has no ID"))?;
    let issuer = issuer(&mut context, "/saml2p:AuthnRequest/saml2:Issuer", KEY)?;
    let destination = find_value(&mut context, "/saml2p:AuthnRequest/@Destination", None)
        .ok_or_else(|| invalid(KEY, "request has no Destination"))?;

    let mut attributes = ImmutableAttributeMap::builder();
    for node in find_nodes(
        &mut context,
        "/saml2p:AuthnRequest/saml2p:Extensions/eidas:RequestedAttributes/eidas:RequestedAttribute",
        None,
    ) {
        let (Some(name), Some(name_format)) = (node.get_attribute("Name"), node.get_attribute("NameFormat")) else {
            return Err(invalid(KEY, "requested attribute without Name or NameFormat"));
        };
        if name_format != NAME_FORMAT_URI {
            return Err(invalid(
                ErrorKey::InvalidAttributeList,
                format!("{name} uses name format {name_format}"),
            ));
        }
        let definition = registry
            .get_by_name(&name)
            .ok_or_else(|| invalid(ErrorKey::InvalidAttributeList, format!("unknown attribute {name}")))?;
        if definition.person_type().is_representative() {
            return Err(invalid(
                ErrorKey::EidasRepresentativeAttributes,
                format!("representative attribute {name} cannot be requested"),
            ));
        }
        let required = node.get_attribute("isRequired").as_deref() == Some("true");
        let definition = definition.with_required(required);
        let values = attribute_values(&mut context, &node, "eidas:AttributeValue", &definition, validator)?;
        attributes = attributes.put(definition, values);
    }

    let comparison = find_value(
        &mut context,
        "/saml2p:AuthnRequest/saml2p:RequestedAuthnContext/@Comparison",
        None,
    )
    .map(|value| value.parse::<LevelOfAssuranceComparison>())
    .transpose()
    .map_err(|e| invalid(ErrorKey::ColleagueRequestInvalidLoa, e.to_string()))?
    .unwrap_or(LevelOfAssuranceComparison::Exact);
    let levels: Vec<LevelOfAssurance> = find_nodes(
        &mut context,
        "/saml2p:AuthnRequest/saml2p:RequestedAuthnContext/saml2:AuthnContextClassRef",
        None,
    )
    .iter()
    .map(|node| LevelOfAssurance::parse(node.get_content().trim()))
    .collect();
    if levels.is_empty() {
        return Err(invalid(ErrorKey::ColleagueRequestInvalidLoa, "no level of assurance requested"));
    }

    let mut builder = EidasAuthenticationRequest::builder()
        .id(&id)
        .issuer(&issuer)
        .destination(&destination)
        .citizen_country_code(citizen_country_code)
        .requested_attributes(attributes.build())
        .levels_of_assurance(levels)
        .comparison(comparison);
    if let Some(url) = find_value(&mut context, "/saml2p:AuthnRequest/@AssertionConsumerServiceURL", None) {
        builder = builder.assertion_consumer_service_url(&url);
    }
    if let Some(binding) = find_value(&mut context, "/saml2p:AuthnRequest/@ProtocolBinding", None) {
        builder = builder.binding(ProtocolBinding::from_uri_or_post(&binding));
    }
    if let Some(provider_name) = find_value(&mut context, "/saml2p:AuthnRequest/@ProviderName", None) {
        builder = builder.provider_name(&provider_name);
    }
    if let Some(force_authn) = find_value(&mut context, "/saml2p:AuthnRequest/@ForceAuthn", None) {
        builder = builder.force_authn(force_authn == "true" || force_authn == "1");
    }
    if let Some(issue_instant) = instant(&mut context, "/saml2p:AuthnRequest/@IssueInstant", KEY)? {
        builder = builder.issue_instant(issue_instant);
    }
    if let Some(sp_type) = find_value(&mut context, "/saml2p:AuthnRequest/saml2p:Extensions/eidas:SPType", None) {
        builder = builder.sp_type(sp_type.parse()?);
    }
    if let Some(format) = find_value(&mut context, "/saml2p:AuthnRequest/saml2p:NameIDPolicy/@Format", None) {
        builder = builder.name_id_format(&format);
    }
    if let Some(requester_id) = find_value(
        &mut context,
        "/saml2p:AuthnRequest/saml2p:Scoping/saml2p:RequesterID",
        None,
    ) {
        builder = builder.requester_id(&requester_id);
    }

    let request = builder.build()?;
    debug!(id = %request.id, issuer = %request.issuer, "parsed authentication request");
    Ok(request)
}

/// Reads the Response element. The assertion, plain or encrypted, is
/// returned as XML for the caller to decrypt and verify.
pub fn parse_response_envelope(input: &[u8]) -> EngineResult<ResponseEnvelope> {
    const KEY: ErrorKey = ErrorKey::ColleagueResponseInvalidSaml;
    let document = parse_document(input).map_err(|e| invalid(KEY, e.to_string()))?;
    let mut context = xpath_context(&document)?;
    if find_nodes(&mut context, "/saml2p:Response", None).is_empty() {
        return Err(invalid(KEY, "not a Response"));
    }

    let id = find_value(&mut context, "/saml2p:Response/@ID", None)
        .ok_or_else(|| invalid(KEY, "response has no ID"))?;
    let in_response_to = find_value(&mut context, "/saml2p:Response/@InResponseTo", None)
        .ok_or_else(|| invalid(KEY, "response has no InResponseTo"))?;
    let issuer = issuer(&mut context, "/saml2p:Response/saml2:Issuer", KEY)?;
    let status_code = find_value(
        &mut context,
        "/saml2p:Response/saml2p:Status/saml2p:StatusCode/@Value",
        None,
    )
    .ok_or_else(|| invalid(KEY, "response has no status code"))?;
    let status = ResponseStatus {
        status_code,
        sub_status_code: find_value(
            &mut context,
            "/saml2p:Response/saml2p:Status/saml2p:StatusCode/saml2p:StatusCode/@Value",
            None,
        ),
        status_message: find_value(
            &mut context,
            "/saml2p:Response/saml2p:Status/saml2p:StatusMessage",
            None,
        ),
    };

    let plain = find_nodes(&mut context, "/saml2p:Response/saml2:Assertion", None);
    let encrypted = find_nodes(&mut context, "/saml2p:Response/saml2:EncryptedAssertion", None);
    let assertion = match (plain.as_slice(), encrypted.as_slice()) {
        ([], []) => None,
        ([node], []) => Some(AssertionPayload::Plain(standalone_element(node)?)),
        ([], [node]) => Some(AssertionPayload::Encrypted(standalone_element(node)?)),
        _ => return Err(invalid(KEY, "response must carry at most one assertion")),
    };

    Ok(ResponseEnvelope {
        id,
        issuer,
        in_response_to,
        destination: find_value(&mut context, "/saml2p:Response/@Destination", None),
        issue_instant: instant(&mut context, "/saml2p:Response/@IssueInstant", KEY)?,
        status,
        assertion,
    })
}

/// Reads a decrypted assertion, unmarshalling every attribute value.
pub fn parse_assertion(
    xml: &str,
    registry: &AttributeRegistry,
    validator: &AttributeValueValidator,
) -> EngineResult<AssertionData> {
    const KEY: ErrorKey = ErrorKey::ColleagueResponseInvalidSaml;
    let document = parse_document(xml.as_bytes()).map_err(|e| invalid(KEY, e.to_string()))?;
    let mut context = xpath_context(&document)?;
    if find_nodes(&mut context, "/saml2:Assertion", None).is_empty() {
        return Err(invalid(KEY, "not an Assertion"));
    }

    let mut attributes = ImmutableAttributeMap::builder();
    for node in find_nodes(
        &mut context,
        "/saml2:Assertion/saml2:AttributeStatement/saml2:Attribute",
        None,
    ) {
        let (Some(name), Some(_)) = (node.get_attribute("Name"), node.get_attribute("NameFormat")) else {
            return Err(invalid(KEY, "attribute without Name or NameFormat"));
        };
        let definition = registry
            .get_by_name(&name)
            .ok_or_else(|| invalid(ErrorKey::InvalidAttributeList, format!("unknown attribute {name}")))?;
        let values = attribute_values(&mut context, &node, "saml2:AttributeValue", definition, validator)?;
        attributes = attributes.put(definition.clone(), values);
    }

    let authorization_decision = match find_nodes(
        &mut context,
        "/saml2:Assertion/saml2:AuthzDecisionStatement",
        None,
    )
    .first()
    {
        None => None,
        Some(node) => {
            let decision = node
                .get_attribute("Decision")
                .ok_or_else(|| invalid(KEY, "authorization decision without Decision"))?
                .parse()?;
            Some(AuthorizationDecision {
                resource: node.get_attribute("Resource").unwrap_or_default(),
                decision,
                action: find_value(&mut context, "saml2:Action", Some(node)).unwrap_or_default(),
                action_namespace: find_value(&mut context, "saml2:Action/@Namespace", Some(node))
                    .unwrap_or_default(),
            })
        }
    };

    const CONFIRMATION: &str =
        "/saml2:Assertion/saml2:Subject/saml2:SubjectConfirmation/saml2:SubjectConfirmationData";
    Ok(AssertionData {
        id: find_value(&mut context, "/saml2:Assertion/@ID", None)
            .ok_or_else(|| invalid(KEY, "assertion has no ID"))?,
        issuer: issuer(&mut context, "/saml2:Assertion/saml2:Issuer", KEY)?,
        subject: find_value(&mut context, "/saml2:Assertion/saml2:Subject/saml2:NameID", None)
            .ok_or_else(|| invalid(KEY, "assertion has no subject"))?,
        subject_name_id_format: find_value(
            &mut context,
            "/saml2:Assertion/saml2:Subject/saml2:NameID/@Format",
            None,
        ),
        confirmation_address: find_value(&mut context, &format!("{CONFIRMATION}/@Address"), None),
        confirmation_in_response_to: find_value(&mut context, &format!("{CONFIRMATION}/@InResponseTo"), None),
        confirmation_not_on_or_after: instant(&mut context, &format!("{CONFIRMATION}/@NotOnOrAfter"), KEY)?,
        recipient: find_value(&mut context, &format!("{CONFIRMATION}/@Recipient"), None),
        not_before: instant(&mut context, "/saml2:Assertion/saml2:Conditions/@NotBefore", KEY)?,
        not_on_or_after: instant(&mut context, "/saml2:Assertion/saml2:Conditions/@NotOnOrAfter", KEY)?,
        audience: find_value(
            &mut context,
            "/saml2:Assertion/saml2:Conditions/saml2:AudienceRestriction/saml2:Audience",
            None,
        ),
        level_of_assurance: find_value(
            &mut context,
            "/saml2:Assertion/saml2:AuthnStatement/saml2:AuthnContext/saml2:AuthnContextClassRef",
            None,
        ),
        locality_address: find_value(
            &mut context,
            "/saml2:Assertion/saml2:AuthnStatement/saml2:SubjectLocality/@Address",
            None,
        ),
        attributes: attributes.build(),
        authorization_decision,
    })
}
