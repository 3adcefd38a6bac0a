use std::{collections::HashMap, time::Duration};

use eidas_engine::{
    attribute::{catalog::natural, AttributeValue, ImmutableAttributeMap},
    crypto::{CertificateValidator, Credential, ProtocolSigner, SignatureAlgorithm},
    loa::{LevelOfAssurance, LevelOfAssuranceComparison, NotifiedLevelOfAssurance},
    metadata::{
        generate_metadata, EidasMetadataParameters, InMemoryMetadataFetcher, MetadataRole, ProtocolMetadataSigner,
        RoleParameters,
    },
    response::status,
    AuthenticationResponse, CorrelationMap, EidasAuthenticationRequest, EngineConfig, EngineError, ErrorKey,
    InMemoryCorrelationMap, ProtocolBinding, ProtocolEngine, SpType,
};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    pkey::PKey,
    rsa::Rsa,
    x509::{X509NameBuilder, X509},
};
use time::OffsetDateTime;

const SP_METADATA: &str = "http://localhost:7001/SP/metadata";
const SP_ACS: &str = "http://localhost:7001/SP/ReturnPage";
const NODE_METADATA: &str = "http://localhost:8080/EidasNode/ServiceMetadata";
const NODE_SSO: &str = "http://localhost:8080/EidasNode/ColleagueRequest";
const REQUEST_ID: &str = "f5e7e0f5-b9b8-4256-a7d0-4090141b326d";

fn credential(common_name: &str) -> Credential {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    Credential::new(builder.build(), Some(key))
}

fn metadata_signer(credential: &Credential, trusted: &[X509]) -> ProtocolMetadataSigner {
    let signer = ProtocolSigner::new(
        credential.clone(),
        SignatureAlgorithm::RsaSha256,
        SignatureAlgorithm::ALL.to_vec(),
        CertificateValidator::default(),
    )
    .unwrap();
    ProtocolMetadataSigner::new(signer, trusted.to_vec())
}

struct Nodes {
    sp: ProtocolEngine,
    node: ProtocolEngine,
    pending: InMemoryCorrelationMap,
}

fn nodes() -> Nodes {
    let properties = HashMap::from([
        ("metadata.restrict.http".to_string(), "false".to_string()),
        ("colleagueRequest.invalidLoA.code".to_string(), "203011".to_string()),
        ("colleagueRequest.invalidLoA.message".to_string(), "invalid.requested.loa".to_string()),
    ]);
    let config = EngineConfig::from_properties(&properties).unwrap();

    let sp_credential = credential("sp.localhost");
    let node_credential = credential("node.localhost");
    let trusted = [
        sp_credential.certificate().clone(),
        node_credential.certificate().clone(),
    ];
    let valid_until = OffsetDateTime::now_utc() + time::Duration::hours(1);

    let mut sp_role = RoleParameters::new(MetadataRole::Sp);
    sp_role.signing_certificates.push(sp_credential.certificate().clone());
    sp_role.encryption_certificates.push(sp_credential.certificate().clone());
    sp_role.bindings.push((ProtocolBinding::Post, SP_ACS.into()));
    sp_role.default_assertion_consumer_url = Some(SP_ACS.into());
    let sp_metadata = EidasMetadataParameters::builder()
        .entity_id(SP_METADATA)
        .valid_until(valid_until)
        .node_country("BE")
        .sp_type(SpType::Public)
        .role(sp_role)
        .build()
        .unwrap();

    let mut node_role = RoleParameters::new(MetadataRole::Idp);
    node_role.signing_certificates.push(node_credential.certificate().clone());
    node_role.bindings.push((ProtocolBinding::Post, NODE_SSO.into()));
    node_role.supported_attributes = vec![
        natural::PERSON_IDENTIFIER.into(),
        natural::CURRENT_FAMILY_NAME.into(),
        natural::CURRENT_GIVEN_NAME.into(),
        natural::DATE_OF_BIRTH.into(),
    ];
    let node_metadata = EidasMetadataParameters::builder()
        .entity_id(NODE_METADATA)
        .valid_until(valid_until)
        .node_country("BE")
        .protocol_versions(vec!["1.2".into()])
        .role(node_role)
        .build()
        .unwrap();

    let sp_signer = metadata_signer(&sp_credential, &trusted);
    let node_signer = metadata_signer(&node_credential, &trusted);
    let fetcher = InMemoryMetadataFetcher::default()
        .with_document(SP_METADATA, generate_metadata(&sp_metadata, &sp_signer).unwrap())
        .with_document(NODE_METADATA, generate_metadata(&node_metadata, &node_signer).unwrap());

    let engine = |credential: Credential, signer: ProtocolMetadataSigner| {
        ProtocolEngine::builder()
            .config(config.clone())
            .signing_credential(credential)
            .metadata_fetcher(fetcher.clone())
            .metadata_signer(signer)
            .build()
            .unwrap()
    };
    Nodes {
        sp: engine(sp_credential, sp_signer),
        node: engine(node_credential, node_signer),
        pending: InMemoryCorrelationMap::new(Duration::from_secs(300), 1_000),
    }
}

fn request() -> EidasAuthenticationRequest {
    EidasAuthenticationRequest::builder()
        .id(REQUEST_ID)
        .issuer(SP_METADATA)
        .destination(NODE_SSO)
        .assertion_consumer_service_url(SP_ACS)
        .provider_name("DEMO-SP")
        .citizen_country_code("BE")
        .level_of_assurance(NotifiedLevelOfAssurance::Low)
        .requested_attributes(
            ImmutableAttributeMap::builder()
                .put_definition(natural::person_identifier())
                .put_definition(natural::current_family_name())
                .put_definition(natural::current_given_name())
                .put_definition(natural::date_of_birth())
                .put_definition(natural::gender().with_required(false))
                .build(),
        )
        .build()
        .unwrap()
}

fn send_request(nodes: &Nodes) -> EidasAuthenticationRequest {
    let message = nodes
        .sp
        .generate_request_message(&request(), NODE_METADATA, &nodes.pending, Some("state"))
        .unwrap();
    let input = nodes.node.decode_message(message.binding, &message.encoded).unwrap();
    nodes.node.unmarshall_request_and_validate(&input, "BE").unwrap()
}

#[test]
fn can_round_trip_request_between_trusted_nodes() {
    let nodes = nodes();
    let received = send_request(&nodes);

    assert_eq!(received.id, REQUEST_ID);
    assert_eq!(received.issuer, SP_METADATA);
    assert_eq!(received.provider_name.as_deref(), Some("DEMO-SP"));
    assert_eq!(
        received.levels_of_assurance,
        vec![LevelOfAssurance::from(NotifiedLevelOfAssurance::Low)]
    );
    // Gender is not supported by the node and is dropped before sending.
    assert_eq!(received.requested_attributes.len(), 4);
    assert!(nodes.pending.get(REQUEST_ID).unwrap().is_some());
    nodes
        .node
        .is_acceptable_http_request(&received, Some(ProtocolBinding::Post))
        .unwrap();
}

#[test]
fn can_refuse_unpublished_non_notified_level() {
    let nodes = nodes();
    let request = request()
        .to_builder()
        .levels_of_assurance(vec![LevelOfAssurance::parse("http://service.memberstate.ms/loa")])
        .comparison(LevelOfAssuranceComparison::Exact)
        .build()
        .unwrap();
    let err = nodes
        .sp
        .generate_request_message(&request, NODE_METADATA, &nodes.pending, None)
        .unwrap_err();
    assert_eq!(err.key(), ErrorKey::ColleagueRequestInvalidLoa);
    assert!(nodes.pending.get(REQUEST_ID).unwrap().is_none());
}

#[test]
fn can_answer_validation_error_with_failure_status() {
    let nodes = nodes();
    let received = send_request(&nodes);

    let error = EngineError::validation(ErrorKey::ColleagueRequestInvalidLoa, "levels out of order");
    let status = nodes.node.error_status(&error);
    let message = nodes
        .node
        .generate_response_error_message(&received, NODE_METADATA, status)
        .unwrap();

    let input = nodes.sp.decode_message(message.binding, &message.encoded).unwrap();
    let context = nodes.sp.validation_context(OffsetDateTime::now_utc());
    let (response, entry) = nodes
        .sp
        .unmarshall_response_and_validate(&input, &context, &nodes.pending)
        .unwrap();
    assert!(response.is_failure());
    assert_eq!(response.status.status_code, status::REQUESTER);
    assert_eq!(
        response.status.status_message.as_deref(),
        Some("203011 - invalid.requested.loa")
    );
    assert_eq!(entry.relay_state.as_deref(), Some("state"));
}

#[test]
fn can_deliver_encrypted_assertion() {
    let nodes = nodes();
    let received = send_request(&nodes);

    let response = AuthenticationResponse::builder()
        .issuer(NODE_METADATA)
        .in_response_to(&received.id)
        .subject("BE/BE/12345")
        .ip_address("192.0.2.10")
        .level_of_assurance(NotifiedLevelOfAssurance::Substantial.value())
        .attributes(
            ImmutableAttributeMap::builder()
                .put(natural::person_identifier(), [AttributeValue::string("BE/BE/12345")])
                .put(natural::current_family_name(), [AttributeValue::string("Garcia")])
                .put(natural::current_given_name(), [AttributeValue::string("Javier")])
                .put(
                    natural::date_of_birth(),
                    [AttributeValue::date(time::macros::date!(1965 - 01 - 01))],
                )
                .build(),
        )
        .build()
        .unwrap();
    let message = nodes.node.generate_response_message(&received, &response).unwrap();
    assert_eq!(message.binding, ProtocolBinding::Post);

    let input = nodes.sp.decode_message(message.binding, &message.encoded).unwrap();
    let context = nodes
        .sp
        .validation_context(OffsetDateTime::now_utc())
        .user_ip("192.0.2.10");
    let (accepted, _) = nodes
        .sp
        .unmarshall_response_and_validate(&input, &context, &nodes.pending)
        .unwrap();
    assert!(accepted.encrypted);
    assert_eq!(accepted.subject.as_deref(), Some("BE/BE/12345"));
    assert_eq!(accepted.country.as_deref(), Some("BE"));
    assert_eq!(
        accepted
            .attributes
            .first_value(natural::CURRENT_FAMILY_NAME)
            .and_then(AttributeValue::as_str),
        Some("Garcia")
    );
    assert!(nodes.pending.get(REQUEST_ID).unwrap().is_none());
}
