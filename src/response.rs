use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use crate::{
    attribute::ImmutableAttributeMap,
    error::{EngineError, EngineResult, ErrorKey},
    utils::{generate_ncname, is_blank},
};

/// Top level and second level SAML status codes.
pub mod status {
    pub const SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
    pub const REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
    pub const RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
    pub const VERSION_MISMATCH: &str = "urn:oasis:names:tc:SAML:2.0:status:VersionMismatch";

    pub const AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";
    pub const INVALID_ATTR_NAME_OR_VALUE: &str =
        "urn:oasis:names:tc:SAML:2.0:status:InvalidAttrNameOrValue";
    pub const INVALID_NAME_ID_POLICY: &str =
        "urn:oasis:names:tc:SAML:2.0:status:InvalidNameIDPolicy";
    pub const REQUEST_DENIED: &str = "urn:oasis:names:tc:SAML:2.0:status:RequestDenied";
    pub const REQUEST_UNSUPPORTED: &str = "urn:oasis:names:tc:SAML:2.0:status:RequestUnsupported";

    pub(crate) const TOP_LEVEL: [&str; 4] = [SUCCESS, REQUESTER, RESPONDER, VERSION_MISMATCH];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub status_code: String,
    pub sub_status_code: Option<String>,
    pub status_message: Option<String>,
}

impl ResponseStatus {
    pub fn success() -> Self {
        Self {
            status_code: status::SUCCESS.into(),
            sub_status_code: None,
            status_message: None,
        }
    }

    pub fn failure(status_code: &str, sub_status_code: Option<&str>, message: &str) -> Self {
        Self {
            status_code: status_code.into(),
            sub_status_code: sub_status_code.map(Into::into),
            status_message: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status_code != status::SUCCESS
    }
}

impl Default for ResponseStatus {
    fn default() -> Self {
        Self::success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny,
    Indeterminate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Permit => "Permit",
            Decision::Deny => "Deny",
            Decision::Indeterminate => "Indeterminate",
        })
    }
}

impl FromStr for Decision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Permit" => Ok(Decision::Permit),
            "Deny" => Ok(Decision::Deny),
            "Indeterminate" => Ok(Decision::Indeterminate),
            other => Err(EngineError::validation(
                ErrorKey::ColleagueResponseInvalidSaml,
                format!("unknown authorization decision {other:?}"),
            )),
        }
    }
}

/// Carried as an `AuthzDecisionStatement` next to the attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub resource: String,
    pub decision: Decision,
    pub action: String,
    pub action_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthenticationResponse {
    pub id: String,
    pub issuer: String,
    pub in_response_to: String,
    pub subject: Option<String>,
    pub subject_name_id_format: Option<String>,
    pub ip_address: Option<String>,
    pub level_of_assurance: Option<String>,
    pub status: ResponseStatus,
    pub attributes: ImmutableAttributeMap,
    pub audience_restriction: Option<String>,
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub issue_instant: OffsetDateTime,
    pub country: Option<String>,
    pub authorization_decision: Option<AuthorizationDecision>,
    /// Whether the assertion arrived encrypted. Only set on unmarshalling.
    pub encrypted: bool,
}

impl AuthenticationResponse {
    pub fn builder() -> AuthenticationResponseBuilder {
        AuthenticationResponseBuilder::default()
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[derive(Debug, Default, Clone)]
pub struct AuthenticationResponseBuilder {
    id: Option<String>,
    issuer: Option<String>,
    in_response_to: Option<String>,
    subject: Option<String>,
    subject_name_id_format: Option<String>,
    ip_address: Option<String>,
    level_of_assurance: Option<String>,
    status: Option<ResponseStatus>,
    attributes: Option<ImmutableAttributeMap>,
    audience_restriction: Option<String>,
    not_before: Option<OffsetDateTime>,
    not_on_or_after: Option<OffsetDateTime>,
    issue_instant: Option<OffsetDateTime>,
    country: Option<String>,
    authorization_decision: Option<AuthorizationDecision>,
    encrypted: bool,
}

impl AuthenticationResponseBuilder {
    pub fn id(self, id: &str) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        Self {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn in_response_to(self, in_response_to: &str) -> Self {
        Self {
            in_response_to: Some(in_response_to.into()),
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        Self {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn subject_name_id_format(self, format: &str) -> Self {
        Self {
            subject_name_id_format: Some(format.into()),
            ..self
        }
    }

    pub fn ip_address(self, ip_address: &str) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            ..self
        }
    }

    pub fn level_of_assurance(self, level: &str) -> Self {
        Self {
            level_of_assurance: Some(level.into()),
            ..self
        }
    }

    pub fn status(self, status: ResponseStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn attributes(self, attributes: ImmutableAttributeMap) -> Self {
        Self {
            attributes: Some(attributes),
            ..self
        }
    }

    pub fn audience_restriction(self, audience: &str) -> Self {
        Self {
            audience_restriction: Some(audience.into()),
            ..self
        }
    }

    pub fn not_before(self, instant: OffsetDateTime) -> Self {
        Self {
            not_before: Some(instant),
            ..self
        }
    }

    pub fn not_on_or_after(self, instant: OffsetDateTime) -> Self {
        Self {
            not_on_or_after: Some(instant),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        Self {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn country(self, country: &str) -> Self {
        Self {
            country: Some(country.into()),
            ..self
        }
    }

    pub fn authorization_decision(self, decision: AuthorizationDecision) -> Self {
        Self {
            authorization_decision: Some(decision),
            ..self
        }
    }

    pub(crate) fn encrypted(self, encrypted: bool) -> Self {
        Self { encrypted, ..self }
    }

    pub fn build(self) -> EngineResult<AuthenticationResponse> {
        let illegal = |detail: String| {
            EngineError::validation(ErrorKey::IllegalArgumentsInBuilder, detail)
        };
        let status = self.status.unwrap_or_default();
        if is_blank(Some(&status.status_code)) {
            return Err(illegal("status code is required".into()));
        }
        if status.is_failure() && !status::TOP_LEVEL.contains(&status.status_code.as_str()) {
            return Err(illegal(format!("unknown status code {}", status.status_code)));
        }
        let issuer = self
            .issuer
            .filter(|v| !is_blank(Some(v)))
            .ok_or_else(|| illegal("issuer is required".into()))?;
        let in_response_to = self
            .in_response_to
            .filter(|v| !is_blank(Some(v)))
            .ok_or_else(|| illegal("in response to is required".into()))?;
        if !status.is_failure() {
            if is_blank(self.subject.as_deref()) {
                return Err(illegal("subject is required on success".into()));
            }
            if is_blank(self.level_of_assurance.as_deref()) {
                return Err(illegal("level of assurance is required on success".into()));
            }
        }

        Ok(AuthenticationResponse {
            id: self.id.filter(|v| !is_blank(Some(v))).unwrap_or_else(generate_ncname),
            issuer,
            in_response_to,
            subject: self.subject,
            subject_name_id_format: self.subject_name_id_format,
            ip_address: self.ip_address,
            level_of_assurance: self.level_of_assurance,
            status,
            attributes: self.attributes.unwrap_or_default(),
            audience_restriction: self.audience_restriction,
            not_before: self.not_before,
            not_on_or_after: self.not_on_or_after,
            issue_instant: self.issue_instant.unwrap_or_else(OffsetDateTime::now_utc),
            country: self.country,
            authorization_decision: self.authorization_decision,
            encrypted: self.encrypted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_build_success_response() {
        let response = AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_request")
            .subject("BE/BE/1234")
            .level_of_assurance("http://eidas.europa.eu/LoA/low")
            .build()
            .unwrap();
        assert!(!response.is_failure());
        assert!(response.id.starts_with('_'));
    }

    #[test]
    fn can_build_failure_without_subject() {
        let response = AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_request")
            .status(ResponseStatus::failure(
                status::REQUESTER,
                Some(status::REQUEST_DENIED),
                "202001 - invalid LoA",
            ))
            .build()
            .unwrap();
        assert!(response.is_failure());
    }

    #[test]
    fn can_reject_incomplete_response() {
        assert!(AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_request")
            .build()
            .is_err());
        assert!(AuthenticationResponse::builder()
            .issuer("https://proxy.be/metadata")
            .in_response_to("_request")
            .status(ResponseStatus::failure("urn:bogus", None, "x"))
            .build()
            .is_err());
    }
}
