use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    tree::{
        c14n::{CanonicalizationMode, CanonicalizationOptions},
        Document, Node,
    },
    xpath::Context,
};
use rand::distributions::{Alphanumeric, DistString};
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::{
    error::{EngineError, EngineResult},
    ns, DATE_TIME_FORMAT,
};

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Fresh SAML identifier. Must be an NCName, so it cannot start with a digit.
pub fn generate_ncname() -> String {
    format!("_{}", random_string(32))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

pub fn parse_document(input: &[u8]) -> EngineResult<Document> {
    let parser = libxml::parser::Parser::default();
    Ok(parser.parse_string(input)?)
}

/// XPath context with every prefix the engine queries registered.
pub fn xpath_context(document: &Document) -> EngineResult<Context> {
    let context = Context::new(document)
        .map_err(|_| EngineError::Xml("failed to create XPath context".into()))?;
    for (prefix, href) in [
        ("saml2p", ns::SAML2_PROTOCOL),
        ("saml2", ns::SAML2_ASSERTION),
        ("ds", ns::XMLDSIG),
        ("xenc", ns::XMLENC),
        ("xenc11", ns::XMLENC11),
        ("md", ns::METADATA),
        ("mdattr", ns::METADATA_ATTRIBUTE),
        ("alg", ns::ALGORITHM_SUPPORT),
        ("eidas", ns::EIDAS_EXTENSIONS),
        ("xsi", ns::XSI),
        ("ec", ns::EXCLUSIVE_C14N),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| EngineError::Xml(format!("failed to register namespace {prefix}")))?;
    }
    Ok(context)
}

/// `findvalue` answers an empty string when nothing matches.
pub fn find_value(context: &mut Context, xpath: &str, node: Option<&Node>) -> Option<String> {
    context
        .findvalue(xpath, node)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn find_nodes(context: &mut Context, xpath: &str, node: Option<&Node>) -> Vec<Node> {
    context.findnodes(xpath, node).unwrap_or_default()
}

pub fn canonicalize(node: &Node, options: CanonicalizationOptions) -> EngineResult<String> {
    let mut node = node.clone();
    node.canonicalize(options)
        .map_err(|_| EngineError::Xml(format!("failed to canonicalize {}", node.get_name())))
}

/// `node` lifted out of its document. Inclusive C14N declares every namespace
/// in scope at `node` on the element itself, so prefixes bound on an
/// ancestor, including those only used inside attribute values, survive.
pub fn standalone_element(node: &Node) -> EngineResult<String> {
    canonicalize(
        node,
        CanonicalizationOptions {
            mode: CanonicalizationMode::Canonical1_0,
            ..CanonicalizationOptions::default()
        },
    )
}

/// Splits a `;` separated list, dropping blanks and repeated entries while
/// keeping first-seen order.
pub fn distinct_values(input: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for value in input.split(';').map(str::trim).filter(|v| !v.is_empty()) {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
    values
}

pub fn format_instant(instant: OffsetDateTime) -> String {
    instant
        .format(&DATE_TIME_FORMAT)
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

pub fn parse_instant(value: &str) -> EngineResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Iso8601::DEFAULT)
        .map_err(|e| EngineError::Xml(format!("invalid instant {value:?}: {e}")))
}

pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Drops a leading `<?xml ...?>` so a document can be embedded in another.
pub fn strip_xml_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    match trimmed.strip_prefix("<?xml") {
        Some(rest) => rest.find("?>").map_or(trimmed, |end| rest[end + 2..].trim_start()),
        None => trimmed,
    }
}

/// Escapes text for use inside an element or a double-quoted attribute.
pub fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Reverses [`escape_xml`] for the predefined entities.
pub fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_dedupe_preserving_order() {
        assert_eq!(
            distinct_values("SHA256;SHA384;SHA512;SHA256"),
            vec!["SHA256", "SHA384", "SHA512"]
        );
        assert_eq!(distinct_values(" a ; ;b;a "), vec!["a", "b"]);
        assert!(distinct_values("").is_empty());
    }

    #[test]
    fn can_generate_ncname() {
        let id = generate_ncname();
        assert!(id.starts_with('_'));
        assert_eq!(id.len(), 33);
        assert_ne!(id, generate_ncname());
    }

    #[test]
    fn can_format_and_parse_instant() {
        let instant = parse_instant("2025-01-08T16:31:18Z").unwrap();
        assert_eq!(parse_instant(&format_instant(instant)).unwrap(), instant);
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn can_find_values_in_document() {
        let document = parse_document(
            br#"<saml2:Issuer xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion"> http://sp </saml2:Issuer>"#,
        )
        .unwrap();
        let mut context = xpath_context(&document).unwrap();
        assert_eq!(
            find_value(&mut context, "/saml2:Issuer/text()", None).as_deref(),
            Some("http://sp")
        );
        assert_eq!(find_value(&mut context, "/saml2:Missing", None), None);
    }
}
