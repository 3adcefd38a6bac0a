use openssl::x509::X509;

use crate::{
    crypto::{Credential, ProtocolSigner},
    error::EngineResult,
};

/// Signs the node's own metadata and checks the signatures of fetched peer
/// metadata.
pub trait MetadataSigner: Send + Sync {
    fn public_signing_credential(&self) -> &Credential;

    fn sign_metadata(&self, xml: &str, id: &str) -> EngineResult<String>;

    /// Returns the certificate the document verified with.
    fn validate_metadata_signature(&self, xml: &str) -> EngineResult<X509>;
}

/// [`MetadataSigner`] backed by a [`ProtocolSigner`] and a fixed set of
/// metadata trust anchors.
#[derive(Debug, Clone)]
pub struct ProtocolMetadataSigner {
    signer: ProtocolSigner,
    trusted: Vec<X509>,
}

impl ProtocolMetadataSigner {
    pub fn new(signer: ProtocolSigner, trusted: Vec<X509>) -> Self {
        Self { signer, trusted }
    }
}

impl MetadataSigner for ProtocolMetadataSigner {
    fn public_signing_credential(&self) -> &Credential {
        self.signer.signing_credential()
    }

    fn sign_metadata(&self, xml: &str, id: &str) -> EngineResult<String> {
        self.signer.sign(xml, id, false)
    }

    fn validate_metadata_signature(&self, xml: &str) -> EngineResult<X509> {
        self.signer.validate_signature(xml, &self.trusted)
    }
}
