//! eIDAS SAML2 protocol engine.
//!
//! Marshals and validates eIDAS authentication requests and responses,
//! signs and encrypts them, and resolves peer trust through signed
//! metadata. [`ProtocolEngine`] is the entry point.

pub mod attribute;
pub mod binding;
pub mod config;
pub mod correlation;
pub mod crypto;
mod engine;
pub mod error;
pub mod loa;
pub mod metadata;
mod processor;
pub mod request;
pub mod response;
mod utils;

use time::format_description::well_known::iso8601::{self, TimePrecision};

pub use binding::ProtocolBinding;
pub use config::EngineConfig;
pub use correlation::{CorrelationEntry, CorrelationMap, InMemoryCorrelationMap};
pub use engine::{
    Correlated, EncodedMessage, ProtocolEngine, ProtocolEngineBuilder, ResponseValidationContext,
};
pub use error::{EngineError, EngineResult, ErrorKey};
pub use request::{EidasAuthenticationRequest, SpType};
pub use response::{AuthenticationResponse, ResponseStatus};

/// Namespace URIs used on the wire.
pub mod ns {
    pub const SAML2_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
    pub const SAML2_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
    pub const XMLDSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
    pub const XMLDSIG11: &str = "http://www.w3.org/2009/xmldsig11#";
    pub const XMLENC: &str = "http://www.w3.org/2001/04/xmlenc#";
    pub const XMLENC11: &str = "http://www.w3.org/2009/xmlenc11#";
    pub const METADATA: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
    pub const METADATA_ATTRIBUTE: &str = "urn:oasis:names:tc:SAML:metadata:attribute";
    pub const ALGORITHM_SUPPORT: &str = "urn:oasis:names:tc:SAML:metadata:algsupport";
    pub const EIDAS_EXTENSIONS: &str = "http://eidas.europa.eu/saml-extensions";
    pub const XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
    pub const XS: &str = "http://www.w3.org/2001/XMLSchema";
    pub const EIDAS_NATURAL: &str = "http://eidas.europa.eu/attributes/naturalperson";
    pub const EIDAS_LEGAL: &str = "http://eidas.europa.eu/attributes/legalperson";
}

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
