use base64::{prelude::BASE64_STANDARD, Engine};
use regex::Regex;
use time::{macros::format_description, Date};

use crate::{
    error::{EngineError, EngineResult},
    utils::{escape_xml, unescape_xml},
};

use super::{AttributeValue, PostalAddress, Value};

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

pub const NATURAL_PERSON_ADDRESS_PREFIX: &str = "eidas-natural";
pub const LEGAL_PERSON_ADDRESS_PREFIX: &str = "eidas-legal";

/// Converts between typed attribute values and their wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueMarshaller {
    /// Latin-script only strings such as identifiers.
    LiteralString,
    /// Strings which may carry a non-Latin-script alternate.
    String,
    Date,
    Gender,
    PostalAddress { prefix: &'static str },
}

impl ValueMarshaller {
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::LiteralString | Self::String, Value::String(_))
                | (Self::Date, Value::Date(_))
                | (Self::Gender, Value::Gender(_))
                | (Self::PostalAddress { .. }, Value::PostalAddress(_))
        )
    }

    pub fn marshal(&self, value: &AttributeValue) -> EngineResult<String> {
        match (self, value.value()) {
            (Self::LiteralString | Self::String, Value::String(s)) => Ok(s.clone()),
            (Self::Date, Value::Date(date)) => date
                .format(DATE_FORMAT)
                .map_err(|e| EngineError::Marshalling(e.to_string())),
            (Self::Gender, Value::Gender(gender)) => Ok(gender.value().to_string()),
            (Self::PostalAddress { prefix }, Value::PostalAddress(address)) => {
                Ok(BASE64_STANDARD.encode(address_lines(prefix, address)))
            }
            (marshaller, other) => Err(EngineError::Marshalling(format!(
                "{marshaller:?} cannot marshal {other:?}"
            ))),
        }
    }

    pub fn unmarshal(
        &self,
        input: &str,
        non_latin_script_alternate: bool,
    ) -> EngineResult<AttributeValue> {
        let value = match self {
            Self::LiteralString | Self::String => Value::String(input.to_string()),
            Self::Date => Value::Date(
                Date::parse(input.trim(), DATE_FORMAT)
                    .map_err(|e| EngineError::Marshalling(format!("invalid date {input:?}: {e}")))?,
            ),
            Self::Gender => Value::Gender(input.trim().parse()?),
            Self::PostalAddress { .. } => Value::PostalAddress(parse_address(input)?),
        };
        Ok(AttributeValue::new(value, non_latin_script_alternate))
    }
}

fn address_fields(address: &PostalAddress) -> [(&'static str, Option<&String>); 11] {
    [
        ("AddressID", address.address_id.as_ref()),
        ("PoBox", address.po_box.as_ref()),
        ("LocatorDesignator", address.locator_designator.as_ref()),
        ("LocatorName", address.locator_name.as_ref()),
        ("CvaddressArea", address.cv_address_area.as_ref()),
        ("Thoroughfare", address.thoroughfare.as_ref()),
        ("PostName", address.post_name.as_ref()),
        ("AdminunitFirstline", address.admin_unit_first_line.as_ref()),
        ("AdminunitSecondline", address.admin_unit_second_line.as_ref()),
        ("PostCode", address.post_code.as_ref()),
        ("FullCvaddress", address.full_cv_address.as_ref()),
    ]
}

fn address_lines(prefix: &str, address: &PostalAddress) -> String {
    address_fields(address)
        .into_iter()
        .filter_map(|(tag, value)| {
            value.map(|v| format!("<{prefix}:{tag}>{}</{prefix}:{tag}>\n", escape_xml(v)))
        })
        .collect()
}

fn parse_address(input: &str) -> EngineResult<PostalAddress> {
    let decoded = crate::utils::decode_xml_base64(input)?;
    let text = String::from_utf8(decoded)
        .map_err(|_| EngineError::Marshalling("postal address is not UTF-8".into()))?;

    let extract = |tag: &str| -> EngineResult<Option<String>> {
        // The regex crate has no backreferences, so the closing prefix is
        // matched loosely.
        let pattern = format!(r"(?is)<(?:[^:>]+:)?{tag}>(.+?)</(?:[^:>]+:)?{tag}>");
        let regex = Regex::new(&pattern).map_err(|e| EngineError::Marshalling(e.to_string()))?;
        Ok(regex.captures(&text).map(|c| unescape_xml(&c[1])))
    };

    let address = PostalAddress {
        address_id: extract("AddressID")?,
        po_box: extract("PoBox")?,
        locator_designator: extract("LocatorDesignator")?,
        locator_name: extract("LocatorName")?,
        cv_address_area: extract("CvaddressArea")?,
        thoroughfare: extract("Thoroughfare")?,
        post_name: extract("PostName")?,
        admin_unit_first_line: extract("AdminunitFirstline")?,
        admin_unit_second_line: extract("AdminunitSecondline")?,
        post_code: extract("PostCode")?,
        full_cv_address: extract("FullCvaddress")?,
    };
    if address.is_empty() {
        return Err(EngineError::Marshalling("postal address has no known part".into()));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Gender;
    use time::macros::date;

    #[test]
    fn can_marshal_date() {
        let value = AttributeValue::date(date!(1965 - 01 - 01));
        assert_eq!(ValueMarshaller::Date.marshal(&value).unwrap(), "1965-01-01");
        assert_eq!(
            ValueMarshaller::Date.unmarshal("1965-01-01", false).unwrap(),
            value
        );
        assert!(ValueMarshaller::Date.unmarshal("01/01/1965", false).is_err());
    }

    #[test]
    fn can_reject_unknown_gender() {
        assert!(ValueMarshaller::Gender.unmarshal("male", false).is_err());
        assert_eq!(
            ValueMarshaller::Gender.unmarshal("Female", false).unwrap(),
            AttributeValue::gender(Gender::Female)
        );
    }

    #[test]
    fn can_marshal_postal_address() {
        let address = PostalAddress {
            post_code: Some("1000".into()),
            full_cv_address: Some("Rue Belliard 28, Brussels".into()),
            ..PostalAddress::default()
        };
        let marshaller = ValueMarshaller::PostalAddress {
            prefix: NATURAL_PERSON_ADDRESS_PREFIX,
        };
        let marshalled = marshaller
            .marshal(&AttributeValue::postal_address(address.clone()))
            .unwrap();
        let text = String::from_utf8(BASE64_STANDARD.decode(&marshalled).unwrap()).unwrap();
        assert_eq!(
            text,
            "<eidas-natural:PostCode>1000</eidas-natural:PostCode>\n\
             <eidas-natural:FullCvaddress>Rue Belliard 28, Brussels</eidas-natural:FullCvaddress>\n"
        );
        let parsed = marshaller.unmarshal(&marshalled, false).unwrap();
        assert_eq!(parsed.value(), &Value::PostalAddress(address));
    }

    #[test]
    fn can_escape_postal_address_markup() {
        let address = PostalAddress {
            thoroughfare: Some("Smith & Sons <Unit 4>".into()),
            ..PostalAddress::default()
        };
        let marshaller = ValueMarshaller::PostalAddress {
            prefix: NATURAL_PERSON_ADDRESS_PREFIX,
        };
        let marshalled = marshaller
            .marshal(&AttributeValue::postal_address(address.clone()))
            .unwrap();
        let text = String::from_utf8(BASE64_STANDARD.decode(&marshalled).unwrap()).unwrap();
        assert_eq!(
            text,
            "<eidas-natural:Thoroughfare>Smith &amp; Sons &lt;Unit 4&gt;</eidas-natural:Thoroughfare>\n"
        );
        let parsed = marshaller.unmarshal(&marshalled, false).unwrap();
        assert_eq!(parsed.value(), &Value::PostalAddress(address));
    }

    #[test]
    fn can_parse_address_without_prefix() {
        let encoded = BASE64_STANDARD.encode("<postName>Madrid</postName>");
        let parsed = parse_address(&encoded).unwrap();
        assert_eq!(parsed.post_name.as_deref(), Some("Madrid"));
    }

    #[test]
    fn can_refuse_mismatched_value() {
        assert!(ValueMarshaller::Date
            .marshal(&AttributeValue::string("1965-01-01"))
            .is_err());
        assert!(!ValueMarshaller::Gender.accepts(&Value::String("Male".into())));
    }
}
