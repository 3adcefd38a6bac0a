//! eIDAS checks applied on top of well-formed messages.

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::{
    attribute::{ImmutableAttributeMap, PersonType},
    binding::ProtocolBinding,
    config::{MandatoryAttributeSets, MandatoryRule},
    error::{EngineError, EngineResult, ErrorKey},
    loa::is_achieved_level_acceptable,
    metadata::{EidasMetadataParameters, MetadataRole},
    request::EidasAuthenticationRequest,
};

/// What the receiving side knows about the exchange a response belongs to.
#[derive(Debug, Clone)]
pub struct ResponseValidationContext {
    pub now: OffsetDateTime,
    /// Address of the user agent that delivered the response.
    pub user_ip: Option<String>,
    pub time_skew_before: Duration,
    pub time_skew_after: Duration,
}

impl ResponseValidationContext {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now,
            user_ip: None,
            time_skew_before: Duration::ZERO,
            time_skew_after: Duration::ZERO,
        }
    }

    pub fn user_ip(self, user_ip: &str) -> Self {
        Self {
            user_ip: Some(user_ip.into()),
            ..self
        }
    }

    pub fn time_skew(self, before: Duration, after: Duration) -> Self {
        Self {
            time_skew_before: before,
            time_skew_after: after,
            ..self
        }
    }
}

/// An empty set has nothing left to require.
fn set_satisfied(set: &[String], rule: MandatoryRule, present: &dyn Fn(&str) -> bool) -> bool {
    if set.is_empty() {
        return true;
    }
    match rule {
        MandatoryRule::All => set.iter().all(|name| present(name)),
        MandatoryRule::Any => set.iter().any(|name| present(name)),
    }
}

/// Natural or legal person attributes have to be there, and whichever of
/// the two kinds shows up has to cover its whole minimum data set. The
/// representative natural or legal set is required as soon as any
/// representative attribute shows up. Requests are checked by name,
/// responses need values.
pub fn check_mandatory_attributes(
    attributes: &ImmutableAttributeMap,
    sets: &MandatoryAttributeSets,
    with_values: bool,
) -> EngineResult<()> {
    let present = |name: &str| {
        if with_values {
            attributes.has_values(name)
        } else {
            attributes.contains(name)
        }
    };
    let has = |person_type: PersonType| {
        attributes
            .definitions()
            .any(|definition| definition.person_type() == person_type)
    };
    let (natural, legal) = (has(PersonType::NaturalPerson), has(PersonType::LegalPerson));
    if !natural && !legal {
        return Err(EngineError::validation(
            ErrorKey::EidasMandatoryAttributes,
            "neither natural nor legal person attributes are present",
        ));
    }
    for (kind, shown, set) in [("natural", natural, &sets.natural), ("legal", legal, &sets.legal)] {
        if shown && !set_satisfied(set, sets.rule, &present) {
            return Err(EngineError::validation(
                ErrorKey::EidasMandatoryAttributes,
                format!("the {kind} person minimum data set is incomplete"),
            ));
        }
    }
    let has_representative = attributes
        .definitions()
        .any(|definition| definition.person_type().is_representative());
    if has_representative
        && !set_satisfied(&sets.representative_natural, sets.rule, &present)
        && !set_satisfied(&sets.representative_legal, sets.rule, &present)
    {
        return Err(EngineError::validation(
            ErrorKey::EidasRepresentativeAttributes,
            "representative attributes without a complete representative data set",
        ));
    }
    Ok(())
}

pub fn check_no_representative_requested(attributes: &ImmutableAttributeMap) -> EngineResult<()> {
    match attributes
        .definitions()
        .find(|definition| definition.person_type().is_representative())
    {
        Some(definition) => Err(EngineError::validation(
            ErrorKey::EidasRepresentativeAttributes,
            format!("representative attribute {} cannot be requested", definition.name_uri()),
        )),
        None => Ok(()),
    }
}

/// Every attribute the request marked required has to come back with a value.
pub fn check_required_attributes_returned(
    requested: &ImmutableAttributeMap,
    returned: &ImmutableAttributeMap,
) -> EngineResult<()> {
    for definition in requested.definitions().filter(|definition| definition.is_required()) {
        if !returned.has_values(definition.name_uri()) {
            return Err(EngineError::validation(
                ErrorKey::AttVerificationMandatory,
                format!("required attribute {} missing from the response", definition.name_uri()),
            ));
        }
    }
    Ok(())
}

/// Keeps the requested attributes the destination publishes. An empty
/// published list means the destination did not restrict its attributes.
pub fn filter_supported_attributes(
    requested: &ImmutableAttributeMap,
    supported: &[String],
) -> EngineResult<ImmutableAttributeMap> {
    if supported.is_empty() {
        return Ok(requested.clone());
    }
    let filtered = requested.filter(|definition| supported.iter().any(|name| name == definition.name_uri()));
    if filtered.len() < requested.len() {
        info!(
            dropped = requested.len() - filtered.len(),
            "requested attributes not supported by the destination"
        );
    }
    if filtered.is_empty() {
        return Err(EngineError::validation(
            ErrorKey::ColleagueRequestAttrNull,
            "none of the requested attributes is supported by the destination",
        ));
    }
    Ok(filtered)
}

/// `NotBefore` and `NotOnOrAfter`, each widened by its configured skew. The
/// end of the window is mandatory.
pub fn check_validity_window(
    not_before: Option<OffsetDateTime>,
    not_on_or_after: Option<OffsetDateTime>,
    context: &ResponseValidationContext,
) -> EngineResult<()> {
    if let Some(not_before) = not_before {
        if context.now < not_before - context.time_skew_before {
            return Err(EngineError::validation(
                ErrorKey::ColleagueResponseInvalidSaml,
                format!("assertion not valid before {not_before}"),
            ));
        }
    }
    let not_on_or_after = not_on_or_after.ok_or_else(|| {
        EngineError::validation(ErrorKey::ColleagueResponseInvalidSaml, "assertion has no NotOnOrAfter")
    })?;
    if context.now >= not_on_or_after + context.time_skew_after {
        return Err(EngineError::validation(
            ErrorKey::ColleagueResponseInvalidSaml,
            format!("assertion expired at {not_on_or_after}"),
        ));
    }
    Ok(())
}

pub fn check_audience(audience: Option<&str>, expected: &str) -> EngineResult<()> {
    match audience {
        Some(audience) if audience == expected => Ok(()),
        Some(audience) => Err(EngineError::validation(
            ErrorKey::AudienceRestriction,
            format!("assertion is for {audience}, not {expected}"),
        )),
        None => Err(EngineError::validation(
            ErrorKey::AudienceRestriction,
            "assertion carries no audience restriction",
        )),
    }
}

pub fn check_in_response_to(in_response_to: &str, request_id: &str) -> EngineResult<()> {
    if in_response_to != request_id {
        warn!(in_response_to, request_id, "response answers another request");
        return Err(EngineError::validation(
            ErrorKey::AuRequestId,
            format!("response answers {in_response_to}, expected {request_id}"),
        ));
    }
    Ok(())
}

pub fn check_destination(destination: Option<&str>, expected: Option<&str>) -> EngineResult<()> {
    match (destination, expected) {
        (Some(destination), Some(expected)) if destination != expected => Err(EngineError::validation(
            ErrorKey::ColleagueRequestInvalidDestUrl,
            format!("message sent to {destination}, expected {expected}"),
        )),
        _ => Ok(()),
    }
}

/// The address bound into the assertion has to be the one presenting it.
pub fn check_ip_address(assertion_address: Option<&str>, user_ip: Option<&str>) -> EngineResult<()> {
    match (assertion_address, user_ip) {
        (Some(address), Some(user_ip)) if address != user_ip => {
            warn!(address, user_ip, "assertion presented from another address");
            Err(EngineError::validation(
                ErrorKey::ColleagueResponseInvalidSaml,
                "subject confirmation address does not match the user",
            ))
        }
        _ => Ok(()),
    }
}

pub fn check_level_of_assurance(request: &EidasAuthenticationRequest, achieved: Option<&str>) -> EngineResult<()> {
    let achieved = achieved.ok_or_else(|| {
        EngineError::validation(ErrorKey::InvalidResponseLoaValue, "response carries no level of assurance")
    })?;
    if !is_achieved_level_acceptable(&request.levels_of_assurance, request.comparison, achieved) {
        return Err(EngineError::validation(
            ErrorKey::InvalidResponseLoaValue,
            format!("achieved level {achieved} does not satisfy the request"),
        ));
    }
    Ok(())
}

/// SP metadata side checks of an incoming request: assertion consumer
/// service, binding and SP type.
pub fn check_request_acceptance(
    request: &EidasAuthenticationRequest,
    metadata: &EidasMetadataParameters,
    http_binding: Option<ProtocolBinding>,
) -> EngineResult<()> {
    let sp = metadata.role(MetadataRole::Sp).ok_or_else(|| {
        EngineError::metadata(
            ErrorKey::SamlEngineInvalidMetadata,
            format!("{} publishes no SP role", metadata.entity_id),
        )
    })?;

    let default_url = sp.default_assertion_consumer_url.as_deref();
    let acs_matches = match (default_url, request.assertion_consumer_service_url.as_deref()) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(default_url), Some(requested)) => default_url == requested,
    };
    if !acs_matches {
        return Err(EngineError::validation(
            ErrorKey::ColleagueRequestInvalidSaml,
            "assertion consumer service differs from the published default",
        ));
    }

    if let Some(binding) = http_binding {
        if !sp.supports_binding(binding) {
            info!(issuer = %request.issuer, %binding, "binding not published by the issuer");
            return Err(EngineError::validation(
                ErrorKey::InvalidProtocolBinding,
                format!("{} does not support {binding}", request.issuer),
            ));
        }
    }

    match (request.sp_type, metadata.sp_type) {
        (Some(_), Some(_)) => Err(EngineError::validation(
            ErrorKey::ColleagueRequestInconsistentSpType,
            "SP type given in both request and metadata",
        )),
        (None, None) => Err(EngineError::validation(
            ErrorKey::ColleagueRequestMissingSpType,
            "SP type given in neither request nor metadata",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attribute::{
            catalog::{legal, natural, representative},
            AttributeValue,
        },
        loa::{LevelOfAssurance, LevelOfAssuranceComparison, NotifiedLevelOfAssurance},
        metadata::RoleParameters,
        request::SpType,
    };

    fn with_values(definitions: Vec<crate::attribute::AttributeDefinition>) -> ImmutableAttributeMap {
        definitions
            .into_iter()
            .fold(ImmutableAttributeMap::builder(), |builder, definition| {
                builder.put(definition, [AttributeValue::string("x")])
            })
            .build()
    }

    #[test]
    fn can_check_mandatory_sets_with_any_rule() {
        let sets = MandatoryAttributeSets {
            rule: MandatoryRule::Any,
            natural: vec![
                natural::PERSON_IDENTIFIER.into(),
                natural::DATE_OF_BIRTH.into(),
                natural::CURRENT_FAMILY_NAME.into(),
                natural::GENDER.into(),
            ],
            ..MandatoryAttributeSets::default()
        };
        let one = with_values(vec![natural::current_family_name()]);
        assert!(check_mandatory_attributes(&one, &sets, true).is_ok());

        let none = with_values(vec![natural::place_of_birth()]);
        assert_eq!(
            check_mandatory_attributes(&none, &sets, true).unwrap_err().key(),
            ErrorKey::EidasMandatoryAttributes
        );
    }

    #[test]
    fn can_check_mandatory_sets_with_all_rule() {
        let sets = MandatoryAttributeSets::default();
        let partial = with_values(vec![natural::person_identifier(), natural::current_family_name()]);
        assert!(check_mandatory_attributes(&partial, &sets, true).is_err());

        let legal_person = with_values(vec![legal::legal_person_identifier(), legal::legal_name()]);
        assert!(check_mandatory_attributes(&legal_person, &sets, true).is_ok());

        let requested = ImmutableAttributeMap::builder()
            .put_definition(legal::legal_person_identifier())
            .put_definition(legal::legal_name())
            .build();
        assert!(check_mandatory_attributes(&requested, &sets, false).is_ok());
        assert!(check_mandatory_attributes(&requested, &sets, true).is_err());
    }

    #[test]
    fn can_require_each_person_set_that_shows_up() {
        let sets = MandatoryAttributeSets::default();
        let mixed = with_values(vec![
            legal::legal_person_identifier(),
            legal::legal_name(),
            natural::person_identifier(),
            natural::current_family_name(),
        ]);
        let err = check_mandatory_attributes(&mixed, &sets, true).unwrap_err();
        assert_eq!(err.key(), ErrorKey::EidasMandatoryAttributes);

        let both = with_values(vec![
            legal::legal_person_identifier(),
            legal::legal_name(),
            natural::person_identifier(),
            natural::current_family_name(),
            natural::current_given_name(),
            natural::date_of_birth(),
        ]);
        assert!(check_mandatory_attributes(&both, &sets, true).is_ok());

        let empty = ImmutableAttributeMap::builder().build();
        assert!(check_mandatory_attributes(&empty, &sets, false).is_err());
    }

    #[test]
    fn can_require_full_representative_set() {
        let sets = MandatoryAttributeSets::default();
        let mut definitions = vec![legal::legal_person_identifier(), legal::legal_name()];
        definitions.push(representative(&natural::person_identifier()));
        let err = check_mandatory_attributes(&with_values(definitions.clone()), &sets, true).unwrap_err();
        assert_eq!(err.key(), ErrorKey::EidasRepresentativeAttributes);

        definitions.extend([
            representative(&natural::current_family_name()),
            representative(&natural::current_given_name()),
            representative(&natural::date_of_birth()),
        ]);
        assert!(check_mandatory_attributes(&with_values(definitions), &sets, true).is_ok());
    }

    #[test]
    fn can_filter_supported_attributes() {
        let requested = ImmutableAttributeMap::builder()
            .put_definition(natural::person_identifier())
            .put_definition(natural::gender())
            .build();
        let supported = vec![natural::PERSON_IDENTIFIER.to_string()];
        let filtered = filter_supported_attributes(&requested, &supported).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filter_supported_attributes(&requested, &[]).unwrap().len(), 2);

        let err = filter_supported_attributes(&requested, &[legal::LEGAL_NAME.to_string()]).unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueRequestAttrNull);
    }

    #[test]
    fn can_check_validity_window_with_skew() {
        let now = OffsetDateTime::now_utc();
        let context = ResponseValidationContext::new(now);
        let later = now + Duration::seconds(30);
        let end = Some(now + Duration::minutes(5));
        assert!(check_validity_window(Some(later), end, &context).is_err());
        let skewed = context.clone().time_skew(Duration::seconds(60), Duration::ZERO);
        assert!(check_validity_window(Some(later), end, &skewed).is_ok());

        let earlier = now - Duration::seconds(30);
        assert!(check_validity_window(None, Some(earlier), &context).is_err());
        let skewed = context.clone().time_skew(Duration::ZERO, Duration::seconds(60));
        assert!(check_validity_window(None, Some(earlier), &skewed).is_ok());

        let err = check_validity_window(None, None, &context).unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueResponseInvalidSaml);
    }

    #[test]
    fn can_check_response_binding() {
        assert_eq!(
            check_audience(Some("https://other"), "https://sp").unwrap_err().key(),
            ErrorKey::AudienceRestriction
        );
        assert!(check_audience(Some("https://sp"), "https://sp").is_ok());
        assert_eq!(check_audience(None, "https://sp").unwrap_err().key(), ErrorKey::AudienceRestriction);
        assert_eq!(check_in_response_to("_a", "_b").unwrap_err().key(), ErrorKey::AuRequestId);
        assert_eq!(
            check_destination(Some("https://a"), Some("https://b")).unwrap_err().key(),
            ErrorKey::ColleagueRequestInvalidDestUrl
        );
        assert!(check_ip_address(Some("10.0.0.1"), Some("10.0.0.2")).is_err());
        assert!(check_ip_address(Some("10.0.0.1"), None).is_ok());
    }

    fn request() -> EidasAuthenticationRequest {
        EidasAuthenticationRequest::builder()
            .issuer("https://connector.be/metadata")
            .destination("https://proxy.be/sso")
            .assertion_consumer_service_url("https://connector.be/acs")
            .citizen_country_code("BE")
            .level_of_assurance(NotifiedLevelOfAssurance::Substantial)
            .build()
            .unwrap()
    }

    #[test]
    fn can_check_achieved_level() {
        let request = request();
        assert!(check_level_of_assurance(&request, Some("http://eidas.europa.eu/LoA/high")).is_ok());
        assert_eq!(
            check_level_of_assurance(&request, Some("http://eidas.europa.eu/LoA/low"))
                .unwrap_err()
                .key(),
            ErrorKey::InvalidResponseLoaValue
        );
        assert!(check_level_of_assurance(&request, None).is_err());
    }

    #[test]
    fn can_refuse_exact_level_outside_expanded_request() {
        let request = request()
            .to_builder()
            .levels_of_assurance(vec![
                NotifiedLevelOfAssurance::Substantial.into(),
                LevelOfAssurance::parse("http://service.memberstate.ms/loa"),
            ])
            .comparison(LevelOfAssuranceComparison::Exact)
            .build()
            .unwrap();
        assert!(check_level_of_assurance(&request, Some("http://eidas.europa.eu/LoA/high")).is_ok());
        assert!(check_level_of_assurance(&request, Some("http://service.memberstate.ms/loa")).is_ok());
        for achieved in ["http://eidas.europa.eu/LoA/low", "http://service.memberstate.ms/other"] {
            assert_eq!(
                check_level_of_assurance(&request, Some(achieved)).unwrap_err().key(),
                ErrorKey::InvalidResponseLoaValue
            );
        }
    }

    #[test]
    fn can_check_request_acceptance() {
        let mut sp = RoleParameters::new(MetadataRole::Sp);
        sp.default_assertion_consumer_url = Some("https://connector.be/acs".into());
        sp.bindings.push((ProtocolBinding::Post, "https://connector.be/acs".into()));
        let metadata = EidasMetadataParameters::builder()
            .entity_id("https://connector.be/metadata")
            .role(sp.clone())
            .build()
            .unwrap();

        let request = request();
        assert_eq!(
            check_request_acceptance(&request, &metadata, Some(ProtocolBinding::Post))
                .unwrap_err()
                .key(),
            ErrorKey::ColleagueRequestMissingSpType
        );
        let public = request.to_builder().sp_type(SpType::Public).build().unwrap();
        assert!(check_request_acceptance(&public, &metadata, Some(ProtocolBinding::Post)).is_ok());
        assert_eq!(
            check_request_acceptance(&public, &metadata, Some(ProtocolBinding::Redirect))
                .unwrap_err()
                .key(),
            ErrorKey::InvalidProtocolBinding
        );

        let with_type = EidasMetadataParameters::builder()
            .entity_id("https://connector.be/metadata")
            .sp_type(SpType::Private)
            .role(sp)
            .build()
            .unwrap();
        assert_eq!(
            check_request_acceptance(&public, &with_type, None).unwrap_err().key(),
            ErrorKey::ColleagueRequestInconsistentSpType
        );
        let elsewhere = public
            .to_builder()
            .assertion_consumer_service_url("https://evil.be/acs")
            .build()
            .unwrap();
        assert_eq!(
            check_request_acceptance(&elsewhere, &metadata, None).unwrap_err().key(),
            ErrorKey::ColleagueRequestInvalidSaml
        );
    }
}
