use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    tree::{
        c14n::{CanonicalizationMode, CanonicalizationOptions},
        Document, Namespace, Node,
    },
    xpath::Context,
};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    pkey::{HasPublic, Id, PKeyRef},
    rsa::Padding,
    sign::{RsaPssSaltlen, Signer, Verifier},
    x509::X509,
};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{
    algorithm::{
        ENVELOPED_SIGNATURE, EXCLUSIVE_C14N, EXCLUSIVE_C14N_WITH_COMMENTS, INCLUSIVE_C14N,
        INCLUSIVE_C14N_WITH_COMMENTS,
    },
    certificate::{certificate_from_base64, fingerprint, same_certificate, subject_name},
    CertificateValidator, Credential, DigestAlgorithm, SignatureAlgorithm,
};
use crate::{
    error::{EngineError, EngineResult, ErrorKey},
    ns,
    utils::{canonicalize, decode_xml_base64, find_nodes, find_value, parse_document, xpath_context},
};

/// How a signature identifies its key.
#[derive(Debug, Clone)]
pub enum SignatureKeyInfo {
    Certificate(X509),
    /// Hex SHA-256 fingerprint of the certificate, used when peers already
    /// hold the certificate through metadata.
    KeyName(String),
}

impl SignatureKeyInfo {
    fn append_to(&self, signature: &mut Node, ds: &Namespace) -> EngineResult<()> {
        let mut key_info = ds_child(signature, ds, "KeyInfo", None)?;
        match self {
            Self::Certificate(certificate) => {
                let mut data = ds_child(&mut key_info, ds, "X509Data", None)?;
                data.add_text_child(
                    Some(ds.clone()),
                    "X509Certificate",
                    &BASE64_STANDARD.encode(certificate.to_der()?),
                )
                .map_err(tree_error)?;
            }
            Self::KeyName(name) => {
                key_info
                    .add_text_child(Some(ds.clone()), "KeyName", name)
                    .map_err(tree_error)?;
            }
        }
        Ok(())
    }

    fn find_trusted<'a>(&self, trusted: &'a [X509]) -> Option<&'a X509> {
        match self {
            Self::Certificate(certificate) => trusted
                .iter()
                .find(|candidate| same_certificate(candidate, certificate)),
            Self::KeyName(name) => trusted.iter().find(|candidate| {
                fingerprint(candidate).is_ok_and(|fp| fp.eq_ignore_ascii_case(name.trim()))
            }),
        }
    }
}

/// Enveloped XML signatures over SAML messages and metadata, plus the
/// detached signature of the HTTP-Redirect binding.
#[derive(Debug, Clone)]
pub struct ProtocolSigner {
    credential: Credential,
    algorithm: SignatureAlgorithm,
    whitelist: Vec<SignatureAlgorithm>,
    certificate_validator: CertificateValidator,
}

impl ProtocolSigner {
    pub fn new(
        credential: Credential,
        algorithm: SignatureAlgorithm,
        whitelist: Vec<SignatureAlgorithm>,
        certificate_validator: CertificateValidator,
    ) -> EngineResult<Self> {
        let key_id = credential.private_key()?.id();
        let key_matches = match key_id {
            Id::EC => algorithm.is_ecdsa(),
            Id::RSA => algorithm.is_rsa(),
            _ => false,
        };
        if !key_matches {
            return Err(EngineError::Configuration(format!(
                "signature algorithm {algorithm} does not fit the signing key"
            )));
        }
        Ok(Self {
            credential,
            algorithm,
            whitelist,
            certificate_validator,
        })
    }

    pub fn signing_credential(&self) -> &Credential {
        &self.credential
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn certificate_validator(&self) -> CertificateValidator {
        self.certificate_validator
    }

    /// Runs the configured certificate checks against `now`.
    pub fn check_certificate(&self, certificate: &X509, now: OffsetDateTime) -> EngineResult<()> {
        self.certificate_validator.validate(certificate, now)
    }

    /// Signs the root element of `xml`, which must carry `ID="{id}"`. The
    /// signature is placed after the issuer, or first when there is none.
    pub fn sign(&self, xml: &str, id: &str, only_key_info_no_cert: bool) -> EngineResult<String> {
        self.check_certificate(self.credential.certificate(), OffsetDateTime::now_utc())?;

        let document = parse_document(xml.as_bytes())?;
        let mut root = root_element(&document)?;
        if root.get_attribute("ID").as_deref() != Some(id) {
            return Err(EngineError::Xml(format!("root element does not carry ID {id}")));
        }
        let digest_algorithm = self.algorithm.digest();
        let canonical = canonicalize(&root, exclusive_c14n())?;
        let digest = BASE64_STANDARD.encode(digest_algorithm.digest(canonical.as_bytes())?);

        let key_info = if only_key_info_no_cert {
            SignatureKeyInfo::KeyName(self.credential.fingerprint()?)
        } else {
            SignatureKeyInfo::Certificate(self.credential.certificate().clone())
        };
        let mut signature = SignatureElement::build(&document, id, self.algorithm, &digest, &key_info)?;
        place_signature(&mut root, &mut signature.element)?;

        let signed_info = canonicalize(&signature.signed_info, exclusive_c14n())?;
        let signature_value = BASE64_STANDARD.encode(self.sign_bytes(signed_info.as_bytes())?);
        signature.value.set_content(&signature_value).map_err(tree_error)?;
        debug!(id = %id, algorithm = %self.algorithm, "signed message");
        Ok(document.to_string())
    }

    /// Verifies the enveloped signature of the root element against the
    /// trusted certificates and returns the certificate that verified it.
    pub fn validate_signature(&self, xml: &str, trusted: &[X509]) -> EngineResult<X509> {
        let document = parse_document(xml.as_bytes())?;
        let mut context = xpath_context(&document)?;
        let mut signatures = find_nodes(&mut context, "/*/ds:Signature", None);
        let mut signature = match signatures.len() {
            0 => return Err(EngineError::MissingSignature("message is not signed".into())),
            1 => signatures.remove(0),
            n => {
                return Err(EngineError::MissingSignature(format!(
                    "{n} signatures on the root element"
                )))
            }
        };

        let missing = |what: &str| EngineError::MissingSignature(format!("signature has no {what}"));
        let signed_info = find_nodes(&mut context, "ds:SignedInfo", Some(&signature))
            .pop()
            .ok_or_else(|| missing("signed info"))?;
        let mut references = find_nodes(&mut context, "ds:Reference", Some(&signed_info));
        let reference = match references.len() {
            0 => return Err(missing("reference")),
            1 => references.remove(0),
            n => {
                return Err(EngineError::invalid_signature(
                    ErrorKey::InvalidCertificateSign,
                    format!("{n} references, expected one"),
                ))
            }
        };
        let method = find_value(&mut context, "ds:SignatureMethod/@Algorithm", Some(&signed_info))
            .ok_or_else(|| missing("signature method"))?;
        let c14n_method = find_nodes(&mut context, "ds:CanonicalizationMethod", Some(&signed_info))
            .pop()
            .ok_or_else(|| missing("canonicalization method"))?;
        let digest_method = find_value(&mut context, "ds:DigestMethod/@Algorithm", Some(&reference))
            .ok_or_else(|| missing("digest method"))?;
        let reference_uri = reference.get_attribute("URI").ok_or_else(|| missing("reference"))?;
        let digest_value = find_value(&mut context, "ds:DigestValue/text()", Some(&reference))
            .ok_or_else(|| missing("digest value"))?;
        let signature_value =
            find_value(&mut context, "ds:SignatureValue/text()", Some(&signature))
                .ok_or_else(|| missing("signature value"))?;
        let key_info = if let Some(certificate) = find_value(
            &mut context,
            "ds:KeyInfo/ds:X509Data/ds:X509Certificate/text()",
            Some(&signature),
        ) {
            SignatureKeyInfo::Certificate(certificate_from_base64(&certificate)?)
        } else if let Some(name) = find_value(&mut context, "ds:KeyInfo/ds:KeyName/text()", Some(&signature)) {
            SignatureKeyInfo::KeyName(name)
        } else {
            return Err(missing("key info"));
        };
        let signed_info_c14n = c14n_options(&mut context, &c14n_method)?;
        let reference_c14n = reference_transforms(&mut context, &reference)?;

        let algorithm = SignatureAlgorithm::from_uri(&method)
            .filter(|alg| self.whitelist.contains(alg))
            .ok_or_else(|| {
                warn!(algorithm = %method, "signature algorithm not allowed");
                EngineError::invalid_signature(
                    ErrorKey::InvalidSignatureAlgorithm,
                    format!("signature algorithm {method} is not allowed"),
                )
            })?;
        let digest_algorithm = DigestAlgorithm::from_uri(&digest_method)
            .filter(|digest| *digest != DigestAlgorithm::Sha1)
            .ok_or_else(|| {
                EngineError::invalid_signature(
                    ErrorKey::InvalidSignatureAlgorithm,
                    format!("digest algorithm {digest_method} is not allowed"),
                )
            })?;

        let certificate = key_info.find_trusted(trusted).cloned().ok_or_else(|| {
            warn!("message signed with an untrusted certificate");
            EngineError::invalid_signature(
                ErrorKey::SamlEngineUntrustedCertificate,
                "signing certificate is not trusted",
            )
        })?;
        self.check_certificate(&certificate, OffsetDateTime::now_utc())?;

        let root = root_element(&document)?;
        let id = root.get_attribute("ID").unwrap_or_default();
        if reference_uri != format!("#{id}") {
            return Err(EngineError::invalid_signature(
                ErrorKey::InvalidCertificateSign,
                format!("signature references {reference_uri}, not the root element {id}"),
            ));
        }

        // SignedInfo is canonicalized where it was received, before the
        // enveloped transform takes the signature out of the tree.
        let signed_octets = canonicalize(&signed_info, signed_info_c14n)?;
        signature.unlink_node();
        let canonical = canonicalize(&root, reference_c14n)?;
        let computed = BASE64_STANDARD.encode(digest_algorithm.digest(canonical.as_bytes())?);
        if computed != digest_value.replace(char::is_whitespace, "") {
            warn!(id = %id, "digest mismatch, message altered after signing");
            return Err(EngineError::invalid_signature(
                ErrorKey::InvalidCertificateSign,
                "digest does not match the signed content",
            ));
        }

        let signature_bytes = decode_xml_base64(&signature_value)?;
        let public_key = certificate.public_key()?;
        if !verify_bytes(algorithm, &public_key, signed_octets.as_bytes(), &signature_bytes)? {
            warn!(id = %id, signer = %subject_name(&certificate), "signature verification failed");
            return Err(EngineError::invalid_signature(
                ErrorKey::InvalidCertificateSign,
                "signature value does not verify",
            ));
        }
        Ok(certificate)
    }

    /// Base64 signature over the HTTP-Redirect signing input.
    pub fn sign_redirect(&self, signing_input: &str) -> EngineResult<String> {
        Ok(BASE64_STANDARD.encode(self.sign_bytes(signing_input.as_bytes())?))
    }

    pub fn verify_redirect(
        &self,
        signing_input: &str,
        sig_alg: &str,
        signature: &str,
        trusted: &[X509],
    ) -> EngineResult<X509> {
        let algorithm = SignatureAlgorithm::from_uri(sig_alg)
            .filter(|alg| self.whitelist.contains(alg))
            .ok_or_else(|| {
                EngineError::invalid_signature(
                    ErrorKey::InvalidSignatureAlgorithm,
                    format!("signature algorithm {sig_alg} is not allowed"),
                )
            })?;
        let signature = decode_xml_base64(signature)?;
        for certificate in trusted {
            let public_key = certificate.public_key()?;
            if verify_bytes(algorithm, &public_key, signing_input.as_bytes(), &signature)
                .unwrap_or(false)
            {
                self.check_certificate(certificate, OffsetDateTime::now_utc())?;
                return Ok(certificate.clone());
            }
        }
        warn!("redirect signature does not verify with any trusted certificate");
        Err(EngineError::invalid_signature(
            ErrorKey::InvalidCertificateSign,
            "redirect signature does not verify",
        ))
    }

    fn sign_bytes(&self, data: &[u8]) -> EngineResult<Vec<u8>> {
        let key = self.credential.private_key()?;
        let digest = self.algorithm.digest().message_digest();
        let mut signer = Signer::new(digest, key)?;
        if self.algorithm.is_pss() {
            signer.set_rsa_padding(Padding::PKCS1_PSS)?;
            signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            signer.set_rsa_mgf1_md(digest)?;
        }
        signer.update(data)?;
        let signature = signer.sign_to_vec()?;
        if self.algorithm.is_ecdsa() {
            // XML signatures carry the raw r || s pair, not DER.
            let field_len = ecdsa_field_len(key)?;
            let sig = EcdsaSig::from_der(&signature)?;
            let mut raw = sig.r().to_vec_padded(field_len)?;
            raw.extend(sig.s().to_vec_padded(field_len)?);
            return Ok(raw);
        }
        Ok(signature)
    }
}

fn verify_bytes<T: HasPublic>(
    algorithm: SignatureAlgorithm,
    key: &PKeyRef<T>,
    data: &[u8],
    signature: &[u8],
) -> EngineResult<bool> {
    let digest = algorithm.digest().message_digest();
    match (key.id(), algorithm.is_ecdsa()) {
        (Id::EC, true) | (Id::RSA, false) => {}
        _ => return Ok(false),
    }
    let der;
    let signature = if algorithm.is_ecdsa() {
        if signature.len() % 2 != 0 {
            return Ok(false);
        }
        let (r, s) = signature.split_at(signature.len() / 2);
        der = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?
            .to_der()?;
        der.as_slice()
    } else {
        signature
    };
    let mut verifier = Verifier::new(digest, key)?;
    if algorithm.is_pss() {
        verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
        verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        verifier.set_rsa_mgf1_md(digest)?;
    }
    verifier.update(data)?;
    Ok(verifier.verify(signature).unwrap_or(false))
}

fn ecdsa_field_len<T: HasPublic>(key: &PKeyRef<T>) -> EngineResult<i32> {
    let bits = key.ec_key()?.group().degree();
    Ok(((bits + 7) / 8) as i32)
}

fn root_element(document: &Document) -> EngineResult<Node> {
    document
        .get_root_element()
        .ok_or_else(|| EngineError::Xml("document has no root element".into()))
}

fn exclusive_c14n() -> CanonicalizationOptions {
    CanonicalizationOptions {
        mode: CanonicalizationMode::ExclusiveCanonical1_0,
        with_comments: false,
        inclusive_ns_prefixes: Vec::new(),
    }
}

/// The canonicalization named by `method`'s Algorithm, keeping the prefixes
/// of an exclusive `InclusiveNamespaces` list.
fn c14n_options(context: &mut Context, method: &Node) -> EngineResult<CanonicalizationOptions> {
    let uri = method.get_attribute("Algorithm").unwrap_or_default();
    let (mode, with_comments) = match uri.as_str() {
        EXCLUSIVE_C14N => (CanonicalizationMode::ExclusiveCanonical1_0, false),
        EXCLUSIVE_C14N_WITH_COMMENTS => (CanonicalizationMode::ExclusiveCanonical1_0, true),
        INCLUSIVE_C14N => (CanonicalizationMode::Canonical1_0, false),
        INCLUSIVE_C14N_WITH_COMMENTS => (CanonicalizationMode::Canonical1_0, true),
        _ => {
            return Err(EngineError::invalid_signature(
                ErrorKey::InvalidSignatureAlgorithm,
                format!("canonicalization {uri} is not supported"),
            ))
        }
    };
    let inclusive_ns_prefixes = match mode {
        CanonicalizationMode::ExclusiveCanonical1_0 => {
            find_value(context, "ec:InclusiveNamespaces/@PrefixList", Some(method))
                .map(|list| list.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default()
        }
        _ => Vec::new(),
    };
    Ok(CanonicalizationOptions {
        mode,
        with_comments,
        inclusive_ns_prefixes,
    })
}

/// Reference transforms other than the enveloped one. Without an explicit
/// canonicalization the node set is serialised with inclusive C14N.
fn reference_transforms(context: &mut Context, reference: &Node) -> EngineResult<CanonicalizationOptions> {
    let mut options = CanonicalizationOptions {
        mode: CanonicalizationMode::Canonical1_0,
        with_comments: false,
        inclusive_ns_prefixes: Vec::new(),
    };
    for transform in find_nodes(context, "ds:Transforms/ds:Transform", Some(reference)) {
        if transform.get_attribute("Algorithm").as_deref() == Some(ENVELOPED_SIGNATURE) {
            continue;
        }
        options = c14n_options(context, &transform)?;
    }
    Ok(options)
}

fn tree_error(e: Box<dyn std::error::Error + Send + Sync>) -> EngineError {
    EngineError::Xml(format!("failed to build signature: {e}"))
}

fn ds_child(parent: &mut Node, ds: &Namespace, name: &str, algorithm: Option<&str>) -> EngineResult<Node> {
    let mut child = parent.new_child(Some(ds.clone()), name).map_err(tree_error)?;
    if let Some(algorithm) = algorithm {
        child.set_attribute("Algorithm", algorithm).map_err(tree_error)?;
    }
    Ok(child)
}

/// A `ds:Signature` built in the target document, with an empty
/// SignatureValue until SignedInfo has been signed in place.
struct SignatureElement {
    element: Node,
    signed_info: Node,
    value: Node,
}

impl SignatureElement {
    fn build(
        document: &Document,
        id: &str,
        algorithm: SignatureAlgorithm,
        digest_value: &str,
        key_info: &SignatureKeyInfo,
    ) -> EngineResult<Self> {
        let mut element = Node::new("Signature", None, document)
            .map_err(|_| EngineError::Xml("failed to create signature element".into()))?;
        let ds = Namespace::new("ds", ns::XMLDSIG, &mut element).map_err(tree_error)?;
        element.set_namespace(&ds).map_err(tree_error)?;

        let mut signed_info = ds_child(&mut element, &ds, "SignedInfo", None)?;
        ds_child(&mut signed_info, &ds, "CanonicalizationMethod", Some(EXCLUSIVE_C14N))?;
        ds_child(&mut signed_info, &ds, "SignatureMethod", Some(algorithm.uri()))?;
        let mut reference = ds_child(&mut signed_info, &ds, "Reference", None)?;
        reference.set_attribute("URI", &format!("#{id}")).map_err(tree_error)?;
        let mut transforms = ds_child(&mut reference, &ds, "Transforms", None)?;
        ds_child(&mut transforms, &ds, "Transform", Some(ENVELOPED_SIGNATURE))?;
        ds_child(&mut transforms, &ds, "Transform", Some(EXCLUSIVE_C14N))?;
        ds_child(&mut reference, &ds, "DigestMethod", Some(algorithm.digest().uri()))?;
        reference
            .add_text_child(Some(ds.clone()), "DigestValue", digest_value)
            .map_err(tree_error)?;

        let value = ds_child(&mut element, &ds, "SignatureValue", None)?;
        key_info.append_to(&mut element, &ds)?;
        Ok(Self {
            element,
            signed_info,
            value,
        })
    }
}

/// Places the signature after the root's own `saml2:Issuer`, or as its first
/// child when the root has no issuer.
fn place_signature(root: &mut Node, signature: &mut Node) -> EngineResult<()> {
    let issuer = root.get_first_element_child().filter(|child| {
        child.get_name() == "Issuer"
            && child
                .get_namespace()
                .is_some_and(|namespace| namespace.get_href() == ns::SAML2_ASSERTION)
    });
    let placed = match (issuer, root.get_first_child()) {
        (Some(mut issuer), _) => issuer.add_next_sibling(signature),
        (None, Some(mut first)) => first.add_prev_sibling(signature),
        (None, None) => root.add_child(signature).map_err(Into::into),
    };
    placed.map_err(tree_error)
}
