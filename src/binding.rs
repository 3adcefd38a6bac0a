//! SAML HTTP-POST and HTTP-Redirect message encodings.

use std::{
    fmt::{Display, Write},
    io::Read,
    str::FromStr,
};

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use url::form_urlencoded;

use crate::{
    error::{EngineError, EngineResult, ErrorKey},
    utils::decode_xml_base64,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    #[default]
    Post,
    Redirect,
}

impl ProtocolBinding {
    #[must_use]
    pub const fn uri(&self) -> &'static str {
        match self {
            ProtocolBinding::Post => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
            ProtocolBinding::Redirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
        }
    }

    /// Bindings other than POST and Redirect are served over POST.
    #[must_use]
    pub fn from_uri_or_post(uri: &str) -> Self {
        uri.parse().unwrap_or(ProtocolBinding::Post)
    }
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.uri())
    }
}

impl FromStr for ProtocolBinding {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            other => Err(EngineError::validation(
                ErrorKey::InvalidProtocolBinding,
                format!("unsupported binding {other}"),
            )),
        }
    }
}

/// Form or query parameter carrying a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageParameter {
    Request,
    Response,
}

impl MessageParameter {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            MessageParameter::Request => "SAMLRequest",
            MessageParameter::Response => "SAMLResponse",
        }
    }
}

pub fn encode_post(xml: &[u8]) -> String {
    BASE64_STANDARD.encode(xml)
}

pub fn decode_post(input: &str, max_size: usize) -> EngineResult<Vec<u8>> {
    let decoded = decode_xml_base64(input)?;
    ensure_size(decoded.len(), max_size)?;
    Ok(decoded)
}

/// Raw DEFLATE followed by base64, as the Redirect binding requires.
pub fn encode_redirect(xml: &[u8]) -> String {
    let compressed = deflate_bytes(xml);
    BASE64_STANDARD.encode(compressed)
}

pub fn decode_redirect(input: &str, max_size: usize) -> EngineResult<Vec<u8>> {
    let compressed = decode_xml_base64(input)?;
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(max_size as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| EngineError::Xml(format!("cannot inflate message: {e}")))?;
    ensure_size(inflated.len(), max_size)?;
    Ok(inflated)
}

fn ensure_size(len: usize, max_size: usize) -> EngineResult<()> {
    if len > max_size {
        return Err(EngineError::validation(
            ErrorKey::MessageFormatUnsupported,
            format!("message of {len} bytes exceeds the {max_size} byte limit"),
        ));
    }
    Ok(())
}

/// The octets signed for a Redirect binding message:
/// `SAMLRequest=..&RelayState=..&SigAlg=..`, each value URL-encoded.
pub fn redirect_signing_input(
    parameter: MessageParameter,
    encoded_message: &str,
    relay_state: Option<&str>,
    signature_algorithm: &str,
) -> String {
    let encode = |value: &str| form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();
    let mut input = String::new();
    let _ = write!(input, "{}={}", parameter.name(), encode(encoded_message));
    if let Some(relay_state) = relay_state {
        let _ = write!(input, "&RelayState={}", encode(relay_state));
    }
    let _ = write!(input, "&SigAlg={}", encode(signature_algorithm));
    input
}

/// The signed octets of a received Redirect query, taken from the raw
/// `name=value` pieces exactly as they arrived. `None` without a message or
/// `SigAlg` piece.
pub fn received_signing_input(parameter: MessageParameter, query: &str) -> Option<String> {
    let piece = |name: &str| {
        query
            .split('&')
            .find(|piece| piece.split_once('=').is_some_and(|(key, _)| key == name))
    };
    let mut input = piece(parameter.name())?.to_string();
    if let Some(relay_state) = piece("RelayState") {
        input.push('&');
        input.push_str(relay_state);
    }
    input.push('&');
    input.push_str(piece("SigAlg")?);
    Some(input)
}
