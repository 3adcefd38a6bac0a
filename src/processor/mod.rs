//! eIDAS request and response processing: the model to and from SAML XML,
//! with the eIDAS rules applied on the way.

mod parse;
mod rules;
mod wire;

use time::{Duration, OffsetDateTime};
use tracing::debug;

pub use parse::{AssertionPayload, ResponseEnvelope};
pub use rules::ResponseValidationContext;

use crate::{
    attribute::{ensure_values_match, AttributeRegistry, AttributeValueValidator, ImmutableAttributeMap},
    binding::ProtocolBinding,
    config::{EngineConfig, MandatoryAttributeSets},
    error::{EngineError, EngineResult, ErrorKey},
    loa::{expand_requested_levels, validate_requested_levels},
    metadata::EidasMetadataParameters,
    request::{EidasAuthenticationRequest, NAME_ID_FORMAT_UNSPECIFIED},
    response::AuthenticationResponse,
};

pub struct EidasProtocolProcessor {
    registry: AttributeRegistry,
    validator: AttributeValueValidator,
    mandatory: MandatoryAttributeSets,
    non_notified_levels: Vec<String>,
    assertion_validity: Duration,
}

impl EidasProtocolProcessor {
    pub fn new(registry: AttributeRegistry, config: &EngineConfig) -> EngineResult<Self> {
        Ok(Self {
            registry,
            validator: AttributeValueValidator::new(
                config.attribute_validation_active,
                config.attribute_value_max_length,
            )?,
            mandatory: config.mandatory_attributes.clone(),
            non_notified_levels: config.non_notified_levels.clone(),
            assertion_validity: config.assertion_validity,
        })
    }

    fn check_values(&self, attributes: &ImmutableAttributeMap) -> EngineResult<()> {
        ensure_values_match(attributes)?;
        for (definition, values) in attributes.iter() {
            for value in values {
                let marshalled = definition.marshaller().marshal(value)?;
                if !self.validator.is_valid(definition, &marshalled) {
                    return Err(EngineError::validation(
                        ErrorKey::InvalidAttributeValue,
                        format!("{} value fails validation", definition.name_uri()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Prepares an outgoing request for a destination publishing
    /// `supported` attributes. Returns the request as sent, with unsupported
    /// attributes dropped and the levels of assurance expanded.
    pub fn marshall_request(
        &self,
        request: &EidasAuthenticationRequest,
        supported: &[String],
    ) -> EngineResult<(EidasAuthenticationRequest, String)> {
        rules::check_no_representative_requested(&request.requested_attributes)?;
        let attributes = rules::filter_supported_attributes(&request.requested_attributes, supported)?;
        self.check_values(&attributes)?;
        rules::check_mandatory_attributes(&attributes, &self.mandatory, false)?;

        let levels = expand_requested_levels(&request.levels_of_assurance, request.comparison);
        validate_requested_levels(&levels, request.comparison, &self.non_notified_levels)?;

        let request = request
            .to_builder()
            .requested_attributes(attributes)
            .levels_of_assurance(levels)
            .build()?;
        let xml = wire::authn_request_xml(&request, &request.levels_of_assurance)?;
        Ok((request, xml))
    }

    /// Structure only. Run [`Self::validate_request`] once the signature has
    /// been checked.
    pub fn unmarshall_request(&self, input: &[u8], citizen_country_code: &str) -> EngineResult<EidasAuthenticationRequest> {
        parse::parse_authn_request(input, &self.registry, &self.validator, citizen_country_code)
    }

    pub fn validate_request(&self, request: &EidasAuthenticationRequest) -> EngineResult<()> {
        rules::check_mandatory_attributes(&request.requested_attributes, &self.mandatory, false)?;
        validate_requested_levels(&request.levels_of_assurance, request.comparison, &self.non_notified_levels)
    }

    pub fn check_request_acceptance(
        &self,
        request: &EidasAuthenticationRequest,
        metadata: &EidasMetadataParameters,
        http_binding: Option<ProtocolBinding>,
    ) -> EngineResult<()> {
        rules::check_request_acceptance(request, metadata, http_binding)
    }

    /// The standalone, unsigned assertion answering `request`.
    pub fn marshall_assertion(
        &self,
        request: &EidasAuthenticationRequest,
        response: &AuthenticationResponse,
        recipient: &str,
        now: OffsetDateTime,
    ) -> EngineResult<(String, String)> {
        rules::check_in_response_to(&response.in_response_to, &request.id)?;
        self.check_values(&response.attributes)?;
        rules::check_mandatory_attributes(&response.attributes, &self.mandatory, true)?;

        let id = crate::utils::generate_ncname();
        let name_id_format = response
            .subject_name_id_format
            .as_deref()
            .or(request.name_id_format.as_deref())
            .unwrap_or(NAME_ID_FORMAT_UNSPECIFIED);
        let context = wire::AssertionContext {
            id: &id,
            in_response_to: &request.id,
            recipient,
            audience: &request.issuer,
            name_id_format,
            now,
            not_on_or_after: now + self.assertion_validity,
        };
        let xml = wire::assertion_xml(response, &context)?;
        Ok((id, xml))
    }

    /// The Response around an already signed or encrypted assertion.
    pub fn marshall_response(
        &self,
        response: &AuthenticationResponse,
        destination: &str,
        assertion: Option<&str>,
    ) -> EngineResult<String> {
        wire::response_xml(response, destination, assertion)
    }

    pub fn unmarshall_envelope(&self, input: &[u8]) -> EngineResult<ResponseEnvelope> {
        parse::parse_response_envelope(input)
    }

    pub fn check_envelope(&self, envelope: &ResponseEnvelope, request: &EidasAuthenticationRequest) -> EngineResult<()> {
        rules::check_in_response_to(&envelope.in_response_to, &request.id)?;
        rules::check_destination(
            envelope.destination.as_deref(),
            request.assertion_consumer_service_url.as_deref(),
        )
    }

    /// A failure status carries no assertion worth reading.
    pub fn failure_response(&self, envelope: &ResponseEnvelope) -> EngineResult<AuthenticationResponse> {
        let mut builder = AuthenticationResponse::builder()
            .id(&envelope.id)
            .issuer(&envelope.issuer)
            .in_response_to(&envelope.in_response_to)
            .status(envelope.status.clone());
        if let Some(issue_instant) = envelope.issue_instant {
            builder = builder.issue_instant(issue_instant);
        }
        builder.build()
    }

    /// Reads a decrypted and verified assertion and checks it against the
    /// request it answers.
    pub fn unmarshall_assertion(
        &self,
        envelope: &ResponseEnvelope,
        assertion_xml: &str,
        request: &EidasAuthenticationRequest,
        context: &ResponseValidationContext,
        encrypted: bool,
    ) -> EngineResult<AuthenticationResponse> {
        let assertion = parse::parse_assertion(assertion_xml, &self.registry, &self.validator)?;
        if assertion.issuer != envelope.issuer {
            return Err(EngineError::validation(
                ErrorKey::ColleagueResponseInvalidSaml,
                format!("assertion issued by {}, response by {}", assertion.issuer, envelope.issuer),
            ));
        }
        if let Some(in_response_to) = &assertion.confirmation_in_response_to {
            rules::check_in_response_to(in_response_to, &request.id)?;
        }
        rules::check_validity_window(assertion.not_before, assertion.not_on_or_after, context)?;
        if let Some(confirmation_end) = assertion.confirmation_not_on_or_after {
            rules::check_validity_window(None, Some(confirmation_end), context)?;
        }
        rules::check_audience(assertion.audience.as_deref(), &request.issuer)?;
        rules::check_destination(
            assertion.recipient.as_deref(),
            request.assertion_consumer_service_url.as_deref(),
        )?;
        let address = assertion
            .confirmation_address
            .clone()
            .or_else(|| assertion.locality_address.clone());
        rules::check_ip_address(address.as_deref(), context.user_ip.as_deref())?;
        rules::check_level_of_assurance(request, assertion.level_of_assurance.as_deref())?;
        rules::check_mandatory_attributes(&assertion.attributes, &self.mandatory, true)?;
        rules::check_required_attributes_returned(&request.requested_attributes, &assertion.attributes)?;

        let mut builder = AuthenticationResponse::builder()
            .id(&envelope.id)
            .issuer(&envelope.issuer)
            .in_response_to(&envelope.in_response_to)
            .subject(&assertion.subject)
            .status(envelope.status.clone())
            .attributes(assertion.attributes)
            .country(&request.citizen_country_code)
            .encrypted(encrypted);
        if let Some(level) = &assertion.level_of_assurance {
            builder = builder.level_of_assurance(level);
        }
        if let Some(format) = &assertion.subject_name_id_format {
            builder = builder.subject_name_id_format(format);
        }
        if let Some(address) = &address {
            builder = builder.ip_address(address);
        }
        if let Some(audience) = &assertion.audience {
            builder = builder.audience_restriction(audience);
        }
        if let Some(not_before) = assertion.not_before {
            builder = builder.not_before(not_before);
        }
        if let Some(not_on_or_after) = assertion.not_on_or_after {
            builder = builder.not_on_or_after(not_on_or_after);
        }
        if let Some(issue_instant) = envelope.issue_instant {
            builder = builder.issue_instant(issue_instant);
        }
        if let Some(decision) = assertion.authorization_decision {
            builder = builder.authorization_decision(decision);
        }
        let response = builder.build()?;
        debug!(id = %response.id, assertion = %assertion.id, encrypted, "assertion accepted");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attribute::{
            catalog::{legal, natural},
            AttributeValue,
        },
        loa::{LevelOfAssurance, LevelOfAssuranceComparison, NotifiedLevelOfAssurance},
        response::ResponseStatus,
    };

    fn processor() -> EidasProtocolProcessor {
        EidasProtocolProcessor::new(AttributeRegistry::eidas(), &EngineConfig::default()).unwrap()
    }

    fn request() -> EidasAuthenticationRequest {
        EidasAuthenticationRequest::builder()
            .id("_req")
            .issuer("https://connector.be/metadata")
            .destination("https://proxy.be/sso")
            .assertion_consumer_service_url("https://connector.be/acs")
            .citizen_country_code("BE")
            .level_of_assurance(NotifiedLevelOfAssurance::Low)
            .requested_attributes(
                ImmutableAttributeMap::builder()
                    .put_definition(legal::legal_person_identifier())
                    .put_definition(legal::legal_name())
                    .put_definition(legal::lei().with_required(false))
                    .build(),
            )
            .build()
            .unwrap()
    }

    fn response() -> AuthenticationResponse {
        AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_req")
            .subject("BE/BE/0123456789")
            .level_of_assurance("http://eidas.europa.eu/LoA/substantial")
            .ip_address("10.0.0.1")
            .attributes(
                ImmutableAttributeMap::builder()
                    .put(legal::legal_person_identifier(), [AttributeValue::string("BE/BE/0123456789")])
                    .put(legal::legal_name(), [AttributeValue::string("Acme")])
                    .build(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn can_round_trip_request() {
        let processor = processor();
        let (sent, xml) = processor.marshall_request(&request(), &[]).unwrap();
        let received = processor.unmarshall_request(xml.as_bytes(), "BE").unwrap();
        processor.validate_request(&received).unwrap();
        assert_eq!(received.id, sent.id);
        assert_eq!(received.issuer, sent.issuer);
        assert_eq!(received.levels_of_assurance, sent.levels_of_assurance);
        assert_eq!(received.requested_attributes.len(), 3);
        assert!(!received
            .requested_attributes
            .definition(legal::LEI)
            .unwrap()
            .is_required());
    }

    #[test]
    fn can_reject_unpublished_non_notified_level() {
        let request = request()
            .to_builder()
            .levels_of_assurance(vec![LevelOfAssurance::parse("http://service.memberstate.ms/loa")])
            .comparison(LevelOfAssuranceComparison::Exact)
            .build()
            .unwrap();
        let err = processor().marshall_request(&request, &[]).unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueRequestInvalidLoa);

        let config = EngineConfig {
            non_notified_levels: vec!["http://service.memberstate.ms/loa".into()],
            ..EngineConfig::default()
        };
        let publishing = EidasProtocolProcessor::new(AttributeRegistry::eidas(), &config).unwrap();
        let (_, xml) = publishing.marshall_request(&request, &[]).unwrap();
        let received = processor().unmarshall_request(xml.as_bytes(), "BE").unwrap();
        assert_eq!(
            processor().validate_request(&received).unwrap_err().key(),
            ErrorKey::ColleagueRequestInvalidLoa
        );
        publishing.validate_request(&received).unwrap();
    }

    #[test]
    fn can_reject_request_without_minimum_data_set() {
        let request = request()
            .to_builder()
            .requested_attributes(
                ImmutableAttributeMap::builder()
                    .put_definition(natural::gender())
                    .build(),
            )
            .build()
            .unwrap();
        let err = processor().marshall_request(&request, &[]).unwrap_err();
        assert_eq!(err.key(), ErrorKey::EidasMandatoryAttributes);
    }

    #[test]
    fn can_reject_notified_level_with_exact_comparison() {
        let request = request()
            .to_builder()
            .comparison(LevelOfAssuranceComparison::Exact)
            .build()
            .unwrap();
        let err = processor().marshall_request(&request, &[]).unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueRequestInvalidLoa);
    }

    #[test]
    fn can_round_trip_assertion() {
        let processor = processor();
        let request = request();
        let now = OffsetDateTime::now_utc();
        let (_, assertion) = processor
            .marshall_assertion(&request, &response(), "https://connector.be/acs", now)
            .unwrap();
        let xml = processor
            .marshall_response(&response(), "https://connector.be/acs", Some(&assertion))
            .unwrap();

        let envelope = processor.unmarshall_envelope(xml.as_bytes()).unwrap();
        let Some(AssertionPayload::Plain(assertion)) = &envelope.assertion else {
            panic!("expected a plain assertion");
        };
        let context = ResponseValidationContext::new(now).user_ip("10.0.0.1");
        let received = processor
            .unmarshall_assertion(&envelope, assertion, &request, &context, false)
            .unwrap();
        assert_eq!(received.subject.as_deref(), Some("BE/BE/0123456789"));
        assert_eq!(received.country.as_deref(), Some("BE"));
        assert_eq!(received.attributes.len(), 2);
        assert!(!received.encrypted);

        let elsewhere = ResponseValidationContext::new(now).user_ip("10.0.0.2");
        assert!(processor
            .unmarshall_assertion(&envelope, assertion, &request, &elsewhere, false)
            .is_err());
        let too_late = ResponseValidationContext::new(now + Duration::minutes(10));
        assert!(processor
            .unmarshall_assertion(&envelope, assertion, &request, &too_late, false)
            .is_err());
    }

    #[test]
    fn can_require_conditions_on_assertion() {
        let processor = processor();
        let request = request();
        let now = OffsetDateTime::now_utc();
        let (_, assertion) = processor
            .marshall_assertion(&request, &response(), "https://connector.be/acs", now)
            .unwrap();
        let xml = processor
            .marshall_response(&response(), "https://connector.be/acs", Some(&assertion))
            .unwrap();
        let envelope = processor.unmarshall_envelope(xml.as_bytes()).unwrap();
        let context = ResponseValidationContext::new(now).user_ip("10.0.0.1");
        let without = |element: &str| {
            let start = assertion.find(&format!("<saml2:{element}")).unwrap();
            let close = format!("</saml2:{element}>");
            let end = assertion.find(&close).unwrap() + close.len();
            format!("{}{}", &assertion[..start], &assertion[end..])
        };

        let err = processor
            .unmarshall_assertion(&envelope, &without("Conditions"), &request, &context, false)
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueResponseInvalidSaml);
        let err = processor
            .unmarshall_assertion(&envelope, &without("AudienceRestriction"), &request, &context, false)
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::AudienceRestriction);
    }

    #[test]
    fn can_require_requested_attributes_in_response() {
        let processor = processor();
        let request = request()
            .to_builder()
            .requested_attributes(
                ImmutableAttributeMap::builder()
                    .put_definition(legal::legal_person_identifier())
                    .put_definition(legal::legal_name())
                    .put_definition(legal::lei())
                    .build(),
            )
            .build()
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let (_, assertion) = processor
            .marshall_assertion(&request, &response(), "https://connector.be/acs", now)
            .unwrap();
        let xml = processor
            .marshall_response(&response(), "https://connector.be/acs", Some(&assertion))
            .unwrap();
        let envelope = processor.unmarshall_envelope(xml.as_bytes()).unwrap();
        let Some(AssertionPayload::Plain(assertion)) = &envelope.assertion else {
            panic!("expected a plain assertion");
        };
        let err = processor
            .unmarshall_assertion(&envelope, assertion, &request, &ResponseValidationContext::new(now), false)
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::AttVerificationMandatory);
    }

    #[test]
    fn can_read_failure_status() {
        let processor = processor();
        let failure = AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_req")
            .status(ResponseStatus::failure(
                crate::response::status::RESPONDER,
                Some(crate::response::status::AUTHN_FAILED),
                "003002 - authentication failed",
            ))
            .build()
            .unwrap();
        let xml = processor
            .marshall_response(&failure, "https://connector.be/acs", None)
            .unwrap();
        let envelope = processor.unmarshall_envelope(xml.as_bytes()).unwrap();
        let received = processor.failure_response(&envelope).unwrap();
        assert!(received.is_failure());
        assert_eq!(received.status, failure.status);
    }
}
