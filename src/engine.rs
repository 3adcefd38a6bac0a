//! The protocol engine: message generation and validation for both ends of
//! an eIDAS exchange, with trust resolved through peer metadata.

use openssl::x509::X509;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::form_urlencoded;

pub use crate::processor::ResponseValidationContext;
use crate::{
    attribute::AttributeRegistry,
    binding::{
        decode_post, decode_redirect, encode_post, encode_redirect, received_signing_input, redirect_signing_input,
        MessageParameter, ProtocolBinding,
    },
    config::EngineConfig,
    correlation::{CorrelationEntry, CorrelationMap},
    crypto::{CertificateValidator, Credential, ProtocolCipher, ProtocolSigner},
    error::{EngineError, EngineResult, ErrorCategory, ErrorKey},
    metadata::{
        generate_metadata, CachingMetadataFetcher, EidasMetadataParameters, HttpMetadataFetcher,
        InMemoryMetadataCache, MetadataClock, MetadataFetcher, MetadataRole, MetadataSigner,
        ProtocolMetadataSigner, SystemClock,
    },
    processor::{AssertionPayload, EidasProtocolProcessor, ResponseEnvelope},
    request::EidasAuthenticationRequest,
    response::{status, AuthenticationResponse, ResponseStatus},
    utils::is_blank,
};

const METADATA_CACHE_ENTRIES: u64 = 1_000;

/// A signed message ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub id: String,
    pub binding: ProtocolBinding,
    /// The XML as signed. Redirect messages carry no enveloped signature.
    pub xml: String,
    /// Base64 for POST, deflated Base64 for Redirect.
    pub encoded: String,
}

/// A response parsed far enough to find the request it answers. Nothing in
/// it is trusted until [`ProtocolEngine::validate_unmarshalled_response`]
/// accepts it.
#[derive(Debug, Clone)]
pub struct Correlated {
    pub id: String,
    pub issuer: String,
    pub in_response_to: String,
    envelope: ResponseEnvelope,
    xml: String,
}

pub struct ProtocolEngine {
    config: EngineConfig,
    processor: EidasProtocolProcessor,
    signer: ProtocolSigner,
    cipher: ProtocolCipher,
    decryption_credential: Option<Credential>,
    metadata_fetcher: Box<dyn MetadataFetcher>,
    metadata_signer: Box<dyn MetadataSigner>,
    clock: Box<dyn MetadataClock>,
}

#[derive(Default)]
pub struct ProtocolEngineBuilder {
    config: Option<EngineConfig>,
    registry: Option<AttributeRegistry>,
    signing_credential: Option<Credential>,
    decryption_credential: Option<Credential>,
    metadata_fetcher: Option<Box<dyn MetadataFetcher>>,
    metadata_signer: Option<Box<dyn MetadataSigner>>,
    clock: Option<Box<dyn MetadataClock>>,
}

impl ProtocolEngineBuilder {
    pub fn config(self, config: EngineConfig) -> Self {
        Self {
            config: Some(config),
            ..self
        }
    }

    /// Defaults to the eIDAS natural and legal person attributes.
    pub fn registry(self, registry: AttributeRegistry) -> Self {
        Self {
            registry: Some(registry),
            ..self
        }
    }

    pub fn signing_credential(self, credential: Credential) -> Self {
        Self {
            signing_credential: Some(credential),
            ..self
        }
    }

    /// Key for incoming encrypted assertions. Defaults to the signing
    /// credential.
    pub fn decryption_credential(self, credential: Credential) -> Self {
        Self {
            decryption_credential: Some(credential),
            ..self
        }
    }

    pub fn metadata_fetcher(self, fetcher: impl MetadataFetcher + 'static) -> Self {
        Self {
            metadata_fetcher: Some(Box::new(fetcher)),
            ..self
        }
    }

    pub fn metadata_signer(self, signer: impl MetadataSigner + 'static) -> Self {
        Self {
            metadata_signer: Some(Box::new(signer)),
            ..self
        }
    }

    pub fn clock(self, clock: impl MetadataClock + 'static) -> Self {
        Self {
            clock: Some(Box::new(clock)),
            ..self
        }
    }

    pub fn build(self) -> EngineResult<ProtocolEngine> {
        let config = self.config.unwrap_or_default();
        let credential = self
            .signing_credential
            .ok_or_else(|| EngineError::Configuration("a signing credential is required".into()))?;
        let signer = ProtocolSigner::new(
            credential,
            config.signature_algorithm,
            config.signature_algorithm_whitelist.clone(),
            CertificateValidator {
                check_validity_period: config.check_certificate_validity_period,
                disallow_self_signed: config.disallow_self_signed_certificate,
            },
        )?;
        if !config
            .encryption_algorithm_whitelist
            .contains(&config.data_encryption_algorithm)
        {
            return Err(EngineError::Configuration(format!(
                "data encryption algorithm {} is not in the whitelist",
                config.data_encryption_algorithm.uri()
            )));
        }
        let cipher = ProtocolCipher::new(
            config.data_encryption_algorithm,
            config.encryption_algorithm_whitelist.clone(),
            config.key_transport_algorithm,
            config.key_agreement_algorithm,
        );
        let metadata_fetcher = match self.metadata_fetcher {
            Some(fetcher) => fetcher,
            None => Box::new(CachingMetadataFetcher::new(
                HttpMetadataFetcher::new(&config.metadata)?,
                InMemoryMetadataCache::new(config.metadata.cache_ttl, METADATA_CACHE_ENTRIES),
            )),
        };
        let metadata_signer = self
            .metadata_signer
            .unwrap_or_else(|| Box::new(ProtocolMetadataSigner::new(signer.clone(), Vec::new())));
        let processor = EidasProtocolProcessor::new(self.registry.unwrap_or_else(AttributeRegistry::eidas), &config)?;

        info!(
            signature = config.signature_algorithm.uri(),
            encryption_mandatory = config.encryption_mandatory,
            whitelist = config.metadata.use_whitelist,
            "protocol engine ready"
        );
        Ok(ProtocolEngine {
            processor,
            signer,
            cipher,
            decryption_credential: self.decryption_credential,
            metadata_fetcher,
            metadata_signer,
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock)),
            config,
        })
    }
}

impl ProtocolEngine {
    pub fn builder() -> ProtocolEngineBuilder {
        ProtocolEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A validation context using the configured clock skews.
    pub fn validation_context(&self, now: OffsetDateTime) -> ResponseValidationContext {
        ResponseValidationContext::new(now).time_skew(self.config.time_skew_before, self.config.time_skew_after)
    }

    fn check_whitelist(&self, url: &str) -> EngineResult<()> {
        let metadata = &self.config.metadata;
        if metadata.use_whitelist && !metadata.whitelist.is_whitelisted(url) {
            warn!(url, "metadata location not whitelisted");
            return Err(EngineError::metadata(
                ErrorKey::SamlEngineInvalidMetadataSource,
                format!("{url} is not a whitelisted metadata location"),
            ));
        }
        Ok(())
    }

    fn fetch_metadata(&self, url: &str) -> EngineResult<EidasMetadataParameters> {
        self.check_whitelist(url)?;
        self.metadata_fetcher
            .get_eidas_metadata(url, self.metadata_signer.as_ref(), self.clock.as_ref())
    }

    fn check_size(&self, input: &[u8]) -> EngineResult<()> {
        if input.len() > self.config.max_message_size {
            return Err(EngineError::validation(
                ErrorKey::MessageFormatUnsupported,
                format!(
                    "message of {} bytes exceeds the {} byte limit",
                    input.len(),
                    self.config.max_message_size
                ),
            ));
        }
        Ok(())
    }

    fn as_text<'a>(&self, input: &'a [u8]) -> EngineResult<&'a str> {
        self.check_size(input)?;
        std::str::from_utf8(input).map_err(|e| EngineError::Xml(format!("message is not UTF-8: {e}")))
    }

    pub fn decode_message(&self, binding: ProtocolBinding, encoded: &str) -> EngineResult<Vec<u8>> {
        match binding {
            ProtocolBinding::Post => decode_post(encoded, self.config.max_message_size),
            ProtocolBinding::Redirect => decode_redirect(encoded, self.config.max_message_size),
        }
    }

    /// Signs and encodes `request` for the proxy service publishing its
    /// metadata at `service_metadata_url`, and records it as pending.
    ///
    /// Attributes the service does not support are dropped before signing.
    /// The returned message holds the request as sent.
    pub fn generate_request_message(
        &self,
        request: &EidasAuthenticationRequest,
        service_metadata_url: &str,
        correlation: &dyn CorrelationMap,
        relay_state: Option<&str>,
    ) -> EngineResult<EncodedMessage> {
        let metadata = self.fetch_metadata(service_metadata_url)?;
        let (sent, xml) = self
            .processor
            .marshall_request(request, metadata.supported_attributes())?;

        let binding = sent.binding.unwrap_or_default();
        if let Some(idp) = metadata.role(MetadataRole::Idp) {
            if !idp.bindings.is_empty() && !idp.supports_binding(binding) {
                return Err(EngineError::validation(
                    ErrorKey::InvalidProtocolBinding,
                    format!("{service_metadata_url} does not support {binding}"),
                ));
            }
        }
        let (xml, encoded) = match binding {
            ProtocolBinding::Post => {
                let signed = self.signer.sign(&xml, &sent.id, false)?;
                let encoded = encode_post(signed.as_bytes());
                (signed, encoded)
            }
            ProtocolBinding::Redirect => {
                let encoded = encode_redirect(xml.as_bytes());
                (xml, encoded)
            }
        };

        let id = sent.id.clone();
        correlation.put(&id, CorrelationEntry::new(sent, relay_state.map(Into::into)))?;
        info!(request_id = %id, destination = %request.destination, %binding, "request generated");
        Ok(EncodedMessage {
            id,
            binding,
            xml,
            encoded,
        })
    }

    /// Query string for a Redirect binding message, with its detached
    /// signature.
    pub fn redirect_query(
        &self,
        parameter: MessageParameter,
        message: &EncodedMessage,
        relay_state: Option<&str>,
    ) -> EngineResult<String> {
        let input = redirect_signing_input(parameter, &message.encoded, relay_state, self.signer.algorithm().uri());
        let signature = self.signer.sign_redirect(&input)?;
        let signature: String = form_urlencoded::byte_serialize(signature.as_bytes()).collect();
        Ok(format!("{input}&Signature={signature}"))
    }

    /// Parses a POSTed request and verifies its enveloped signature against
    /// the issuer's metadata. `citizen_country_code` is the country of the
    /// receiving proxy service.
    pub fn unmarshall_request_and_validate(
        &self,
        input: &[u8],
        citizen_country_code: &str,
    ) -> EngineResult<EidasAuthenticationRequest> {
        let xml = self.as_text(input)?;
        let request = self.processor.unmarshall_request(input, citizen_country_code)?;
        let metadata = self.fetch_metadata(&request.issuer)?;
        if self.config.validate_signature {
            self.signer
                .validate_signature(xml, metadata.signing_certificates(MetadataRole::Sp))?;
        }
        self.processor.validate_request(&request)?;
        info!(request_id = %request.id, issuer = %request.issuer, "request accepted");
        Ok(request)
    }

    /// Reads a Redirect binding query string and verifies its detached
    /// signature. Returns the request with the relay state it came with.
    pub fn unmarshall_redirect_request_and_validate(
        &self,
        query: &str,
        citizen_country_code: &str,
    ) -> EngineResult<(EidasAuthenticationRequest, Option<String>)> {
        let mut saml_request = None;
        let mut relay_state = None;
        let mut sig_alg = None;
        let mut signature = None;
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*name {
                "SAMLRequest" => saml_request = Some(value.into_owned()),
                "RelayState" => relay_state = Some(value.into_owned()),
                "SigAlg" => sig_alg = Some(value.into_owned()),
                "Signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let saml_request = saml_request.ok_or_else(|| {
            EngineError::validation(ErrorKey::ColleagueRequestInvalidSaml, "query carries no SAMLRequest")
        })?;

        let input = self.decode_message(ProtocolBinding::Redirect, &saml_request)?;
        let request = self.processor.unmarshall_request(&input, citizen_country_code)?;
        let metadata = self.fetch_metadata(&request.issuer)?;
        if self.config.validate_signature {
            let (Some(sig_alg), Some(signature)) = (&sig_alg, &signature) else {
                return Err(EngineError::MissingSignature("redirect request is not signed".into()));
            };
            let signing_input = received_signing_input(MessageParameter::Request, query).ok_or_else(|| {
                EngineError::validation(ErrorKey::ColleagueRequestInvalidSaml, "query carries no signed parameters")
            })?;
            self.signer.verify_redirect(
                &signing_input,
                sig_alg,
                signature,
                metadata.signing_certificates(MetadataRole::Sp),
            )?;
        }
        self.processor.validate_request(&request)?;
        info!(request_id = %request.id, issuer = %request.issuer, "redirect request accepted");
        Ok((request, relay_state))
    }

    /// Checks a validated request against what its issuer publishes: the
    /// assertion consumer service, the binding it arrived on and the SP
    /// type.
    pub fn is_acceptable_http_request(
        &self,
        request: &EidasAuthenticationRequest,
        http_binding: Option<ProtocolBinding>,
    ) -> EngineResult<()> {
        let metadata = self.fetch_metadata(&request.issuer)?;
        self.processor.check_request_acceptance(request, &metadata, http_binding)
    }

    fn assertion_consumer_service(
        &self,
        request: &EidasAuthenticationRequest,
        metadata: Option<&EidasMetadataParameters>,
    ) -> Option<String> {
        request.assertion_consumer_service_url.clone().or_else(|| {
            metadata
                .and_then(|metadata| metadata.role(MetadataRole::Sp))
                .and_then(|sp| sp.default_assertion_consumer_url.clone())
        })
    }

    /// Answers `request` with a signed, and normally encrypted, assertion.
    /// Responses always travel over POST.
    pub fn generate_response_message(
        &self,
        request: &EidasAuthenticationRequest,
        response: &AuthenticationResponse,
    ) -> EngineResult<EncodedMessage> {
        if response.is_failure() {
            return Err(EngineError::validation(
                ErrorKey::IllegalArgumentsInBuilder,
                "failure statuses go through generate_response_error_message",
            ));
        }
        let metadata = self.fetch_metadata(&request.issuer)?;
        let destination = self
            .assertion_consumer_service(request, Some(&metadata))
            .ok_or_else(|| {
                EngineError::validation(
                    ErrorKey::ColleagueRequestInvalidDestUrl,
                    format!("no assertion consumer service known for {}", request.issuer),
                )
            })?;

        let now = OffsetDateTime::now_utc();
        let (assertion_id, assertion) = self
            .processor
            .marshall_assertion(request, response, &destination, now)?;
        let assertion = if self.config.sign_assertions {
            self.signer.sign(&assertion, &assertion_id, false)?
        } else {
            assertion
        };
        let assertion = match metadata.encryption_certificate(MetadataRole::Sp) {
            Ok(certificate) => self
                .cipher
                .encrypt_assertion(&assertion, certificate, &metadata.protocol_versions)?,
            Err(e) if self.config.encryption_mandatory => {
                warn!(issuer = %request.issuer, "encryption mandatory but no encryption certificate");
                return Err(e);
            }
            Err(_) => {
                debug!(issuer = %request.issuer, "no encryption certificate, sending assertion in clear");
                assertion
            }
        };

        let xml = self
            .processor
            .marshall_response(response, &destination, Some(&assertion))?;
        let xml = self.signer.sign(&xml, &response.id, false)?;
        info!(response_id = %response.id, in_response_to = %request.id, "response generated");
        Ok(EncodedMessage {
            id: response.id.clone(),
            binding: ProtocolBinding::Post,
            encoded: encode_post(xml.as_bytes()),
            xml,
        })
    }

    /// The failure status a peer receives for `error`. The message carries
    /// the configured code and text, never internal detail.
    pub fn error_status(&self, error: &EngineError) -> ResponseStatus {
        let description = self.config.errors.describe_error(error);
        let message = format!("{} - {}", description.code, description.message);
        let sub_status = match error.key() {
            ErrorKey::AuthenticationFailed => Some(status::AUTHN_FAILED),
            ErrorKey::AttVerificationMandatory
            | ErrorKey::InvalidAttributeList
            | ErrorKey::InvalidAttributeValue
            | ErrorKey::EidasMandatoryAttributes => Some(status::INVALID_ATTR_NAME_OR_VALUE),
            _ if error.category() == ErrorCategory::Validation => Some(status::REQUEST_DENIED),
            _ => None,
        };
        let status_code = match error.category() {
            ErrorCategory::Validation => status::REQUESTER,
            _ => status::RESPONDER,
        };
        ResponseStatus::failure(status_code, sub_status, &message)
    }

    /// A signed response carrying `status` and no assertion.
    pub fn generate_response_error_message(
        &self,
        request: &EidasAuthenticationRequest,
        issuer: &str,
        status: ResponseStatus,
    ) -> EngineResult<EncodedMessage> {
        let illegal = |detail: &str| EngineError::validation(ErrorKey::IllegalArgumentsInBuilder, detail.to_string());
        if !status.is_failure() {
            return Err(illegal("an error response needs a failure status"));
        }
        if is_blank(status.status_message.as_deref()) {
            return Err(illegal("an error response needs a status message"));
        }
        // The requester may be the reason for the failure, so its metadata is
        // optional here.
        let metadata = self.fetch_metadata(&request.issuer).ok();
        let destination = self
            .assertion_consumer_service(request, metadata.as_ref())
            .ok_or_else(|| illegal("an error response needs an assertion consumer service"))?;

        let response = AuthenticationResponse::builder()
            .issuer(issuer)
            .in_response_to(&request.id)
            .status(status)
            .build()?;
        let xml = self.processor.marshall_response(&response, &destination, None)?;
        let xml = self.signer.sign(&xml, &response.id, false)?;
        info!(response_id = %response.id, in_response_to = %request.id, "error response generated");
        Ok(EncodedMessage {
            id: response.id,
            binding: ProtocolBinding::Post,
            encoded: encode_post(xml.as_bytes()),
            xml,
        })
    }

    /// Parses a response far enough to correlate it. Whitelisting is
    /// enforced here, before any cryptography.
    pub fn unmarshall_response(&self, input: &[u8]) -> EngineResult<Correlated> {
        let xml = self.as_text(input)?;
        let envelope = self.processor.unmarshall_envelope(input)?;
        self.check_whitelist(&envelope.issuer)?;
        Ok(Correlated {
            id: envelope.id.clone(),
            issuer: envelope.issuer.clone(),
            in_response_to: envelope.in_response_to.clone(),
            envelope,
            xml: xml.to_string(),
        })
    }

    fn check_assertion_signature(&self, assertion: &str, trusted: &[X509]) -> EngineResult<()> {
        match self.signer.validate_signature(assertion, trusted) {
            Ok(_) => Ok(()),
            Err(EngineError::MissingSignature(_))
                if !(self.config.validate_signature && self.config.sign_assertions) =>
            {
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "assertion signature rejected");
                Err(EngineError::invalid_signature(
                    ErrorKey::InvalidAssertionSignature,
                    e.to_string(),
                ))
            }
        }
    }

    /// Verifies a correlated response against the request it answers and
    /// returns the authentication result. A failure status is returned as a
    /// response, not as an error.
    pub fn validate_unmarshalled_response(
        &self,
        correlated: &Correlated,
        request: &EidasAuthenticationRequest,
        context: &ResponseValidationContext,
    ) -> EngineResult<AuthenticationResponse> {
        let envelope = &correlated.envelope;
        let metadata = self.fetch_metadata(&correlated.issuer)?;
        let trusted = metadata.signing_certificates(MetadataRole::Idp);
        if self.config.validate_signature {
            self.signer.validate_signature(&correlated.xml, trusted)?;
        }
        self.processor.check_envelope(envelope, request)?;
        if let Some(idp) = metadata.role(MetadataRole::Idp) {
            if !idp.bindings.is_empty() && !idp.bindings.iter().any(|(_, location)| *location == request.destination) {
                return Err(EngineError::validation(
                    ErrorKey::ColleagueResponseInvalidSaml,
                    format!("{} was not the destination of request {}", correlated.issuer, request.id),
                ));
            }
        }

        if envelope.status.is_failure() {
            info!(response_id = %correlated.id, "failure response received");
            return self.processor.failure_response(envelope);
        }
        let payload = envelope.assertion.as_ref().ok_or_else(|| {
            EngineError::validation(
                ErrorKey::ColleagueResponseInvalidSaml,
                "successful response carries no assertion",
            )
        })?;
        let (assertion, encrypted) = match payload {
            AssertionPayload::Encrypted(xml) => {
                let credential = self
                    .decryption_credential
                    .as_ref()
                    .unwrap_or_else(|| self.signer.signing_credential());
                (self.cipher.decrypt_assertion(xml, credential)?, true)
            }
            AssertionPayload::Plain(_) if self.config.encryption_mandatory => {
                warn!(response_id = %correlated.id, "unencrypted assertion refused");
                return Err(EngineError::encryption(
                    ErrorKey::SamlEngineUnencryptedResponse,
                    "assertion is not encrypted",
                ));
            }
            AssertionPayload::Plain(xml) => (xml.clone(), false),
        };
        self.check_assertion_signature(&assertion, trusted)?;

        let response = self
            .processor
            .unmarshall_assertion(envelope, &assertion, request, context, encrypted)?;
        info!(response_id = %response.id, in_response_to = %request.id, "response accepted");
        Ok(response)
    }

    /// Correlates, consumes the pending request and validates, in that
    /// order. The pending request cannot be consumed twice.
    pub fn unmarshall_response_and_validate(
        &self,
        input: &[u8],
        context: &ResponseValidationContext,
        correlation: &dyn CorrelationMap,
    ) -> EngineResult<(AuthenticationResponse, CorrelationEntry)> {
        let correlated = self.unmarshall_response(input)?;
        let entry = correlation.take(&correlated.in_response_to)?;
        let response = self.validate_unmarshalled_response(&correlated, &entry.request, context)?;
        Ok((response, entry))
    }

    /// This node's metadata, signed.
    pub fn generate_metadata(&self, parameters: &EidasMetadataParameters) -> EngineResult<String> {
        generate_metadata(parameters, self.metadata_signer.as_ref())
    }
}
