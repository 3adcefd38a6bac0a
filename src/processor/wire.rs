//! SAML messages as sent on the wire.

use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    attribute::{AttributeDefinition, AttributeValue, ImmutableAttributeMap, NAME_FORMAT_URI},
    error::{EngineError, EngineResult},
    loa::LevelOfAssurance,
    request::EidasAuthenticationRequest,
    response::{AuthenticationResponse, ResponseStatus},
    utils::format_instant,
};

pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";
pub const CONSENT_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:2.0:consent:unspecified";
pub const CONSENT_OBTAINED: &str = "urn:oasis:names:tc:SAML:2.0:consent:obtained";
pub const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

#[derive(YaSerialize)]
#[yaserde(
  rename = "AuthnRequest",
  namespaces = {
    "saml2p" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml2" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "eidas" = "http://eidas.europa.eu/saml-extensions",
  },
  prefix = "saml2p"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "Consent")]
    consent: String,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: bool,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: bool,
    #[yaserde(attribute = true, rename = "ProviderName")]
    provider_name: Option<String>,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: Option<String>,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml2")]
    issuer: Issuer,
    #[yaserde(rename = "Extensions", prefix = "saml2p")]
    extensions: RequestExtensions,
    #[yaserde(rename = "NameIDPolicy", prefix = "saml2p")]
    name_id_policy: Option<NameIdPolicy>,
    #[yaserde(rename = "RequestedAuthnContext", prefix = "saml2p")]
    requested_authn_context: RequestedAuthnContext,
    #[yaserde(rename = "Scoping", prefix = "saml2p")]
    scoping: Option<Scoping>,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct Text {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct RequestExtensions {
    #[yaserde(rename = "SPType", prefix = "eidas")]
    sp_type: Option<Text>,
    #[yaserde(rename = "RequestedAttributes", prefix = "eidas")]
    requested_attributes: RequestedAttributes,
}

#[derive(YaSerialize)]
struct RequestedAttributes {
    #[yaserde(rename = "RequestedAttribute", prefix = "eidas")]
    attributes: Vec<RequestedAttribute>,
}

#[derive(YaSerialize)]
struct RequestedAttribute {
    #[yaserde(attribute = true, rename = "FriendlyName")]
    friendly_name: String,
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(attribute = true, rename = "NameFormat")]
    name_format: String,
    #[yaserde(attribute = true, rename = "isRequired")]
    is_required: bool,
    #[yaserde(rename = "AttributeValue", prefix = "eidas")]
    values: Vec<Text>,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
}

#[derive(YaSerialize)]
struct RequestedAuthnContext {
    #[yaserde(attribute = true, rename = "Comparison")]
    comparison: String,
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml2")]
    class_refs: Vec<Text>,
}

#[derive(YaSerialize)]
struct Scoping {
    #[yaserde(rename = "RequesterID", prefix = "saml2p")]
    requester_id: Text,
}

#[derive(YaSerialize)]
#[yaserde(
  rename = "Response",
  namespaces = {
    "saml2p" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml2" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "saml2p"
)]
struct Response {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(attribute = true, rename = "Consent")]
    consent: String,
    #[yaserde(rename = "Issuer", prefix = "saml2")]
    issuer: Issuer,
    #[yaserde(rename = "Status", prefix = "saml2p")]
    status: Status,
}

#[derive(YaSerialize)]
struct Status {
    #[yaserde(rename = "StatusCode", prefix = "saml2p")]
    status_code: StatusCode,
    #[yaserde(rename = "StatusMessage", prefix = "saml2p")]
    status_message: Option<Text>,
}

#[derive(YaSerialize)]
struct StatusCode {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
    #[yaserde(rename = "StatusCode", prefix = "saml2p")]
    sub_status_code: Option<SubStatusCode>,
}

#[derive(YaSerialize)]
struct SubStatusCode {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
}

// xsi:type values reference the eIDAS attribute namespaces, so every one of
// them is declared on the assertion.
#[derive(YaSerialize)]
#[yaserde(
  rename = "Assertion",
  namespaces = {
    "saml2" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "xsi" = "http://www.w3.org/2001/XMLSchema-instance",
    "xs" = "http://www.w3.org/2001/XMLSchema",
    "eidas-natural" = "http://eidas.europa.eu/attributes/naturalperson",
    "eidas-legal" = "http://eidas.europa.eu/attributes/legalperson",
    "eidas-natural-representative" = "http://eidas.europa.eu/attributes/naturalperson/representative",
    "eidas-legal-representative" = "http://eidas.europa.eu/attributes/legalperson/representative",
  },
  prefix = "saml2"
)]
struct Assertion {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(rename = "Issuer", prefix = "saml2")]
    issuer: Issuer,
    #[yaserde(rename = "Subject", prefix = "saml2")]
    subject: Subject,
    #[yaserde(rename = "Conditions", prefix = "saml2")]
    conditions: Conditions,
    #[yaserde(rename = "AuthnStatement", prefix = "saml2")]
    authn_statement: AuthnStatement,
    #[yaserde(rename = "AttributeStatement", prefix = "saml2")]
    attribute_statement: Option<AttributeStatement>,
    #[yaserde(rename = "AuthzDecisionStatement", prefix = "saml2")]
    authz_decision_statement: Option<AuthzDecisionStatement>,
}

#[derive(YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml2")]
    name_id: NameId,
    #[yaserde(rename = "SubjectConfirmation", prefix = "saml2")]
    subject_confirmation: SubjectConfirmation,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct SubjectConfirmation {
    #[yaserde(attribute = true, rename = "Method")]
    method: String,
    #[yaserde(rename = "SubjectConfirmationData", prefix = "saml2")]
    data: SubjectConfirmationData,
}

#[derive(YaSerialize)]
struct SubjectConfirmationData {
    #[yaserde(attribute = true, rename = "Address")]
    address: Option<String>,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: String,
    #[yaserde(attribute = true, rename = "Recipient")]
    recipient: String,
}

#[derive(YaSerialize)]
struct Conditions {
    #[yaserde(attribute = true, rename = "NotBefore")]
    not_before: String,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: String,
    #[yaserde(rename = "AudienceRestriction", prefix = "saml2")]
    audience_restriction: AudienceRestriction,
}

#[derive(YaSerialize)]
struct AudienceRestriction {
    #[yaserde(rename = "Audience", prefix = "saml2")]
    audience: Text,
}

#[derive(YaSerialize)]
struct AuthnStatement {
    #[yaserde(attribute = true, rename = "AuthnInstant")]
    authn_instant: String,
    #[yaserde(rename = "SubjectLocality", prefix = "saml2")]
    subject_locality: Option<SubjectLocality>,
    #[yaserde(rename = "AuthnContext", prefix = "saml2")]
    authn_context: AuthnContext,
}

#[derive(YaSerialize)]
struct SubjectLocality {
    #[yaserde(attribute = true, rename = "Address")]
    address: String,
}

#[derive(YaSerialize)]
struct AuthnContext {
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml2")]
    class_ref: Text,
}

#[derive(YaSerialize)]
struct AttributeStatement {
    #[yaserde(rename = "Attribute", prefix = "saml2")]
    attributes: Vec<Attribute>,
}

#[derive(YaSerialize)]
struct Attribute {
    #[yaserde(attribute = true, rename = "FriendlyName")]
    friendly_name: String,
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
    #[yaserde(attribute = true, rename = "LatinScript")]
    latin_script: Option<bool>,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct AuthzDecisionStatement {
    #[yaserde(attribute = true, rename = "Decision")]
    decision: String,
    #[yaserde(attribute = true, rename = "Resource")]
    resource: String,
    #[yaserde(rename = "Action", prefix = "saml2")]
    action: Action,
}

#[derive(YaSerialize)]
struct Action {
    #[yaserde(attribute = true, rename = "Namespace")]
    namespace: String,
    #[yaserde(text = true)]
    content: String,
}

fn text(content: &str) -> Text {
    Text {
        content: content.into(),
    }
}

fn entity_issuer(issuer: &str) -> Issuer {
    Issuer {
        format: NAME_ID_FORMAT_ENTITY.into(),
        content: issuer.into(),
    }
}

fn marshal_values(definition: &AttributeDefinition, values: &[AttributeValue]) -> EngineResult<Vec<(String, bool)>> {
    values
        .iter()
        .map(|value| {
            Ok((
                definition.marshaller().marshal(value)?,
                value.is_non_latin_script_alternate(),
            ))
        })
        .collect()
}

fn to_string<T: YaSerialize>(message: &T) -> EngineResult<String> {
    yaserde::ser::to_string(message).map_err(EngineError::Xml)
}

/// `levels` are the AuthnContextClassRef values, already expanded for the
/// comparison in use.
pub fn authn_request_xml(request: &EidasAuthenticationRequest, levels: &[LevelOfAssurance]) -> EngineResult<String> {
    let attributes = request
        .requested_attributes
        .iter()
        .map(|(definition, values)| {
            Ok(RequestedAttribute {
                friendly_name: definition.friendly_name().into(),
                name: definition.name_uri().into(),
                name_format: NAME_FORMAT_URI.into(),
                is_required: definition.is_required(),
                values: marshal_values(definition, values)?
                    .into_iter()
                    .map(|(content, _)| Text { content })
                    .collect(),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let message = AuthnRequest {
        id: request.id.clone(),
        version: "2.0".into(),
        issue_instant: format_instant(request.issue_instant),
        destination: request.destination.clone(),
        consent: CONSENT_UNSPECIFIED.into(),
        force_authn: request.force_authn,
        is_passive: false,
        provider_name: request.provider_name.clone(),
        protocol_binding: request.binding.map(|binding| binding.to_string()),
        assertion_consumer_service_url: request.assertion_consumer_service_url.clone(),
        issuer: entity_issuer(&request.issuer),
        extensions: RequestExtensions {
            sp_type: request.sp_type.map(|sp_type| text(sp_type.value())),
            requested_attributes: RequestedAttributes { attributes },
        },
        name_id_policy: request.name_id_format.as_ref().map(|format| NameIdPolicy {
            allow_create: true,
            format: format.clone(),
        }),
        requested_authn_context: RequestedAuthnContext {
            comparison: request.comparison.value().into(),
            class_refs: levels.iter().map(|level| text(level.value())).collect(),
        },
        scoping: request.requester_id.as_deref().map(|requester_id| Scoping {
            requester_id: text(requester_id),
        }),
    };
    to_string(&message)
}

/// Everything the assertion needs that is not part of the response model.
pub struct AssertionContext<'a> {
    pub id: &'a str,
    pub in_response_to: &'a str,
    pub recipient: &'a str,
    pub audience: &'a str,
    pub name_id_format: &'a str,
    pub now: OffsetDateTime,
    pub not_on_or_after: OffsetDateTime,
}

pub fn assertion_xml(response: &AuthenticationResponse, context: &AssertionContext) -> EngineResult<String> {
    let attributes = response
        .attributes
        .iter()
        .map(|(definition, values)| {
            Ok(Attribute {
                friendly_name: definition.friendly_name().into(),
                name: definition.name_uri().into(),
                name_format: NAME_FORMAT_URI.into(),
                values: marshal_values(definition, values)?
                    .into_iter()
                    .map(|(content, non_latin)| TypedValue {
                        xsi_type: definition.xml_type().to_string(),
                        latin_script: non_latin.then_some(false),
                        content,
                    })
                    .collect(),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let not_on_or_after = response.not_on_or_after.unwrap_or(context.not_on_or_after);
    let assertion = Assertion {
        id: context.id.into(),
        version: "2.0".into(),
        issue_instant: format_instant(context.now),
        issuer: entity_issuer(&response.issuer),
        subject: Subject {
            name_id: NameId {
                format: context.name_id_format.into(),
                content: response.subject.clone().unwrap_or_default(),
            },
            subject_confirmation: SubjectConfirmation {
                method: BEARER.into(),
                data: SubjectConfirmationData {
                    address: response.ip_address.clone(),
                    in_response_to: context.in_response_to.into(),
                    not_on_or_after: format_instant(context.not_on_or_after),
                    recipient: context.recipient.into(),
                },
            },
        },
        conditions: Conditions {
            not_before: format_instant(response.not_before.unwrap_or(context.now)),
            not_on_or_after: format_instant(not_on_or_after),
            audience_restriction: AudienceRestriction {
                audience: text(
                    response
                        .audience_restriction
                        .as_deref()
                        .unwrap_or(context.audience),
                ),
            },
        },
        authn_statement: AuthnStatement {
            authn_instant: format_instant(context.now),
            subject_locality: response.ip_address.as_ref().map(|address| SubjectLocality {
                address: address.clone(),
            }),
            authn_context: AuthnContext {
                class_ref: text(response.level_of_assurance.as_deref().unwrap_or_default()),
            },
        },
        attribute_statement: (!attributes.is_empty()).then_some(AttributeStatement { attributes }),
        authz_decision_statement: response.authorization_decision.as_ref().map(|decision| {
            AuthzDecisionStatement {
                decision: decision.decision.to_string(),
                resource: decision.resource.clone(),
                action: Action {
                    namespace: decision.action_namespace.clone(),
                    content: decision.action.clone(),
                },
            }
        }),
    };
    to_string(&assertion)
}

/// The response envelope. `assertion` is embedded as is, after the status.
pub fn response_xml(
    response: &AuthenticationResponse,
    destination: &str,
    assertion: Option<&str>,
) -> EngineResult<String> {
    let status: &ResponseStatus = &response.status;
    let message = Response {
        id: response.id.clone(),
        version: "2.0".into(),
        issue_instant: format_instant(response.issue_instant),
        destination: destination.into(),
        in_response_to: response.in_response_to.clone(),
        consent: if status.is_failure() {
            CONSENT_UNSPECIFIED.into()
        } else {
            CONSENT_OBTAINED.into()
        },
        issuer: entity_issuer(&response.issuer),
        status: Status {
            status_code: StatusCode {
                value: status.status_code.clone(),
                sub_status_code: status
                    .sub_status_code
                    .as_ref()
                    .map(|value| SubStatusCode { value: value.clone() }),
            },
            status_message: status.status_message.as_deref().map(text),
        },
    };
    let xml = to_string(&message)?;
    match assertion {
        None => Ok(xml),
        Some(assertion) => embed_before_close(&xml, "</saml2p:Response>", assertion),
    }
}

fn embed_before_close(xml: &str, closing_tag: &str, fragment: &str) -> EngineResult<String> {
    let position = xml
        .rfind(closing_tag)
        .ok_or_else(|| EngineError::Xml(format!("no {closing_tag} to embed into")))?;
    let fragment = crate::utils::strip_xml_declaration(fragment);
    Ok(format!("{}{fragment}{}", &xml[..position], &xml[position..]))
}
