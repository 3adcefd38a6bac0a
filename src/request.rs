use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use crate::{
    attribute::ImmutableAttributeMap,
    binding::ProtocolBinding,
    error::{EngineError, EngineResult, ErrorKey},
    loa::{LevelOfAssurance, LevelOfAssuranceComparison},
    utils::{generate_ncname, is_blank},
};

pub const NAME_ID_FORMAT_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// Longest requester id the engine accepts.
pub const MAX_REQUESTER_ID_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpType {
    Public,
    Private,
}

impl SpType {
    #[must_use]
    pub const fn value(&self) -> &'static str {
        match self {
            SpType::Public => "public",
            SpType::Private => "private",
        }
    }
}

impl fmt::Display for SpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

impl FromStr for SpType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "public" => Ok(SpType::Public),
            "private" => Ok(SpType::Private),
            other => Err(EngineError::validation(
                ErrorKey::ConnectorInvalidSpType,
                format!("unknown SP type {other:?}"),
            )),
        }
    }
}

/// An eIDAS authentication request, in the form the engine marshals and
/// returns after unmarshalling.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EidasAuthenticationRequest {
    pub id: String,
    pub issuer: String,
    pub destination: String,
    pub assertion_consumer_service_url: Option<String>,
    pub binding: Option<ProtocolBinding>,
    pub provider_name: Option<String>,
    pub requested_attributes: ImmutableAttributeMap,
    pub citizen_country_code: String,
    pub origin_country_code: Option<String>,
    pub sp_type: Option<SpType>,
    pub levels_of_assurance: Vec<LevelOfAssurance>,
    pub comparison: LevelOfAssuranceComparison,
    pub name_id_format: Option<String>,
    pub requester_id: Option<String>,
    pub force_authn: bool,
    pub issue_instant: OffsetDateTime,
}

impl EidasAuthenticationRequest {
    pub fn builder() -> EidasAuthenticationRequestBuilder {
        EidasAuthenticationRequestBuilder::default()
    }

    /// Builder primed with every field of this request.
    pub fn to_builder(&self) -> EidasAuthenticationRequestBuilder {
        EidasAuthenticationRequestBuilder {
            id: Some(self.id.clone()),
            issuer: Some(self.issuer.clone()),
            destination: Some(self.destination.clone()),
            assertion_consumer_service_url: self.assertion_consumer_service_url.clone(),
            binding: self.binding,
            provider_name: self.provider_name.clone(),
            requested_attributes: Some(self.requested_attributes.clone()),
            citizen_country_code: Some(self.citizen_country_code.clone()),
            origin_country_code: self.origin_country_code.clone(),
            sp_type: self.sp_type,
            levels_of_assurance: self.levels_of_assurance.clone(),
            comparison: Some(self.comparison),
            name_id_format: self.name_id_format.clone(),
            requester_id: self.requester_id.clone(),
            force_authn: self.force_authn,
            issue_instant: Some(self.issue_instant),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EidasAuthenticationRequestBuilder {
    id: Option<String>,
    issuer: Option<String>,
    destination: Option<String>,
    assertion_consumer_service_url: Option<String>,
    binding: Option<ProtocolBinding>,
    provider_name: Option<String>,
    requested_attributes: Option<ImmutableAttributeMap>,
    citizen_country_code: Option<String>,
    origin_country_code: Option<String>,
    sp_type: Option<SpType>,
    levels_of_assurance: Vec<LevelOfAssurance>,
    comparison: Option<LevelOfAssuranceComparison>,
    name_id_format: Option<String>,
    requester_id: Option<String>,
    force_authn: bool,
    issue_instant: Option<OffsetDateTime>,
}

impl EidasAuthenticationRequestBuilder {
    pub fn id(self, id: &str) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        Self {
            id: Some(generate_ncname()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        Self {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        Self {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn assertion_consumer_service_url(self, url: &str) -> Self {
        Self {
            assertion_consumer_service_url: Some(url.into()),
            ..self
        }
    }

    pub fn binding(self, binding: ProtocolBinding) -> Self {
        Self {
            binding: Some(binding),
            ..self
        }
    }

    pub fn provider_name(self, provider_name: &str) -> Self {
        Self {
            provider_name: Some(provider_name.into()),
            ..self
        }
    }

    pub fn requested_attributes(self, attributes: ImmutableAttributeMap) -> Self {
        Self {
            requested_attributes: Some(attributes),
            ..self
        }
    }

    pub fn citizen_country_code(self, country: &str) -> Self {
        Self {
            citizen_country_code: Some(country.into()),
            ..self
        }
    }

    pub fn origin_country_code(self, country: &str) -> Self {
        Self {
            origin_country_code: Some(country.into()),
            ..self
        }
    }

    pub fn sp_type(self, sp_type: SpType) -> Self {
        Self {
            sp_type: Some(sp_type),
            ..self
        }
    }

    pub fn level_of_assurance(mut self, level: impl Into<LevelOfAssurance>) -> Self {
        let level = level.into();
        if !self.levels_of_assurance.contains(&level) {
            self.levels_of_assurance.push(level);
        }
        self
    }

    pub fn levels_of_assurance(self, levels: Vec<LevelOfAssurance>) -> Self {
        Self {
            levels_of_assurance: levels,
            ..self
        }
    }

    pub fn comparison(self, comparison: LevelOfAssuranceComparison) -> Self {
        Self {
            comparison: Some(comparison),
            ..self
        }
    }

    pub fn name_id_format(self, format: &str) -> Self {
        Self {
            name_id_format: Some(format.into()),
            ..self
        }
    }

    pub fn requester_id(self, requester_id: &str) -> Self {
        Self {
            requester_id: Some(requester_id.into()),
            ..self
        }
    }

    pub fn force_authn(self, force_authn: bool) -> Self {
        Self {
            force_authn,
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        Self {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn build(self) -> EngineResult<EidasAuthenticationRequest> {
        let illegal = |detail: &str| {
            EngineError::validation(ErrorKey::IllegalArgumentsInBuilder, detail.to_string())
        };
        let required = |value: Option<String>, name: &str| {
            value
                .filter(|v| !is_blank(Some(v)))
                .ok_or_else(|| illegal(&format!("{name} is required")))
        };

        let citizen_country_code = required(self.citizen_country_code, "citizen country code")?;
        if !is_country_code(&citizen_country_code) {
            return Err(EngineError::validation(
                ErrorKey::ColleagueRequestInvalidCountryCode,
                format!("invalid citizen country code {citizen_country_code:?}"),
            ));
        }
        if let Some(requester_id) = &self.requester_id {
            if requester_id.chars().count() > MAX_REQUESTER_ID_LENGTH {
                return Err(EngineError::validation(
                    ErrorKey::InvalidRequesterId,
                    "requester id exceeds 1024 characters",
                ));
            }
        }
        if self.levels_of_assurance.is_empty() {
            return Err(illegal("a level of assurance is required"));
        }

        Ok(EidasAuthenticationRequest {
            id: self.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(generate_ncname),
            issuer: required(self.issuer, "issuer")?,
            destination: required(self.destination, "destination")?,
            assertion_consumer_service_url: self.assertion_consumer_service_url,
            binding: self.binding,
            provider_name: self.provider_name,
            requested_attributes: self.requested_attributes.unwrap_or_default(),
            citizen_country_code,
            origin_country_code: self.origin_country_code,
            sp_type: self.sp_type,
            levels_of_assurance: self.levels_of_assurance,
            comparison: self.comparison.unwrap_or_default(),
            name_id_format: self.name_id_format,
            requester_id: self.requester_id,
            force_authn: self.force_authn,
            issue_instant: self.issue_instant.unwrap_or_else(OffsetDateTime::now_utc),
        })
    }
}

/// ISO 3166-1 alpha-2 shape: two upper case ASCII letters.
pub fn is_country_code(value: &str) -> bool {
    value.len() == 2 && value.bytes().all(|b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loa::NotifiedLevelOfAssurance;

    fn builder() -> EidasAuthenticationRequestBuilder {
        EidasAuthenticationRequest::builder()
            .issuer("http://localhost:7001/SP/metadata")
            .destination("https://proxy.be/ServiceProvider")
            .citizen_country_code("BE")
            .level_of_assurance(NotifiedLevelOfAssurance::Low)
    }

    #[test]
    fn can_build_request_with_generated_id() {
        let request = builder().build().unwrap();
        assert!(request.id.starts_with('_'));
        assert_eq!(request.comparison, LevelOfAssuranceComparison::Minimum);
        assert!(request.requested_attributes.is_empty());

        let copy = request.to_builder().build().unwrap();
        assert_eq!(copy, request);
    }

    #[test]
    fn can_reject_bad_country_code() {
        let err = builder().citizen_country_code("be").build().unwrap_err();
        assert_eq!(err.key(), ErrorKey::ColleagueRequestInvalidCountryCode);
    }

    #[test]
    fn can_limit_requester_id() {
        assert!(builder().requester_id(&"r".repeat(1024)).build().is_ok());
        let err = builder().requester_id(&"r".repeat(1025)).build().unwrap_err();
        assert_eq!(err.key(), ErrorKey::InvalidRequesterId);
    }

    #[test]
    fn can_require_issuer_and_level() {
        assert!(EidasAuthenticationRequest::builder()
            .destination("https://proxy.be")
            .citizen_country_code("BE")
            .level_of_assurance(NotifiedLevelOfAssurance::Low)
            .build()
            .is_err());
        assert!(EidasAuthenticationRequest::builder()
            .issuer("http://sp")
            .destination("https://proxy.be")
            .citizen_country_code("BE")
            .build()
            .is_err());
    }

    #[test]
    fn can_parse_sp_type() {
        assert_eq!("public".parse::<SpType>().unwrap(), SpType::Public);
        assert!("Public".parse::<SpType>().is_err());
    }
}
