//! eIDAS attribute model: definitions, typed values and the maps carrying
//! them in requests and responses.

pub mod catalog;
mod marshaller;
mod registry;
mod validator;
mod value;

use std::fmt;

pub use marshaller::ValueMarshaller;
pub use registry::AttributeRegistry;
pub use validator::{AttributeValueValidator, UNIQUE_IDENTIFIER_PATTERN};
pub(crate) use value::ensure_values_match;
pub use value::{
    AttributeValue, Gender, ImmutableAttributeMap, ImmutableAttributeMapBuilder, PostalAddress,
    Value,
};

use crate::error::{EngineError, EngineResult, ErrorKey};

/// `NameFormat` of every eIDAS attribute.
pub const NAME_FORMAT_URI: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:uri";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersonType {
    NaturalPerson,
    LegalPerson,
    RepresentativeNaturalPerson,
    RepresentativeLegalPerson,
}

impl PersonType {
    #[must_use]
    pub const fn is_representative(&self) -> bool {
        matches!(
            self,
            Self::RepresentativeNaturalPerson | Self::RepresentativeLegalPerson
        )
    }
}

/// Qualified `xsi:type` of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlType {
    pub namespace_uri: String,
    pub local_part: String,
    pub prefix: String,
}

impl XmlType {
    pub fn new(namespace_uri: &str, local_part: &str, prefix: &str) -> Self {
        Self {
            namespace_uri: namespace_uri.into(),
            local_part: local_part.into(),
            prefix: prefix.into(),
        }
    }
}

impl fmt::Display for XmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.local_part)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeDefinition {
    name_uri: String,
    friendly_name: String,
    person_type: PersonType,
    required: bool,
    unique_identifier: bool,
    transliteration_mandatory: bool,
    xml_type: XmlType,
    marshaller: ValueMarshaller,
}

impl AttributeDefinition {
    pub fn builder(name_uri: &str) -> AttributeDefinitionBuilder {
        AttributeDefinitionBuilder {
            name_uri: Some(name_uri.into()),
            ..AttributeDefinitionBuilder::default()
        }
    }

    pub fn name_uri(&self) -> &str {
        &self.name_uri
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn person_type(&self) -> PersonType {
        self.person_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_unique_identifier(&self) -> bool {
        self.unique_identifier
    }

    pub fn is_transliteration_mandatory(&self) -> bool {
        self.transliteration_mandatory
    }

    pub fn xml_type(&self) -> &XmlType {
        &self.xml_type
    }

    pub fn marshaller(&self) -> &ValueMarshaller {
        &self.marshaller
    }

    /// Same definition with another `required` flag, as used when a request
    /// asks for an attribute with a different requirement level.
    #[must_use]
    pub fn with_required(&self, required: bool) -> Self {
        Self {
            required,
            ..self.clone()
        }
    }
}

#[derive(Debug, Default)]
pub struct AttributeDefinitionBuilder {
    name_uri: Option<String>,
    friendly_name: Option<String>,
    person_type: Option<PersonType>,
    required: bool,
    unique_identifier: bool,
    transliteration_mandatory: bool,
    xml_type: Option<XmlType>,
    marshaller: Option<ValueMarshaller>,
}

impl AttributeDefinitionBuilder {
    pub fn friendly_name(self, friendly_name: &str) -> Self {
        Self {
            friendly_name: Some(friendly_name.into()),
            ..self
        }
    }

    pub fn person_type(self, person_type: PersonType) -> Self {
        Self {
            person_type: Some(person_type),
            ..self
        }
    }

    pub fn required(self, required: bool) -> Self {
        Self { required, ..self }
    }

    pub fn unique_identifier(self, unique_identifier: bool) -> Self {
        Self {
            unique_identifier,
            ..self
        }
    }

    pub fn transliteration_mandatory(self, transliteration_mandatory: bool) -> Self {
        Self {
            transliteration_mandatory,
            ..self
        }
    }

    pub fn xml_type(self, xml_type: XmlType) -> Self {
        Self {
            xml_type: Some(xml_type),
            ..self
        }
    }

    pub fn marshaller(self, marshaller: ValueMarshaller) -> Self {
        Self {
            marshaller: Some(marshaller),
            ..self
        }
    }

    pub fn build(self) -> EngineResult<AttributeDefinition> {
        let illegal = |what: &str| {
            EngineError::validation(
                ErrorKey::IllegalArgumentsInBuilder,
                format!("attribute definition: {what}"),
            )
        };
        let name_uri = self
            .name_uri
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| illegal("name URI is required"))?;
        url::Url::parse(&name_uri).map_err(|_| illegal("name is not an absolute URI"))?;
        let friendly_name = self
            .friendly_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| illegal("friendly name is required"))?;
        Ok(AttributeDefinition {
            name_uri,
            friendly_name,
            person_type: self.person_type.ok_or_else(|| illegal("person type is required"))?,
            required: self.required,
            unique_identifier: self.unique_identifier,
            transliteration_mandatory: self.transliteration_mandatory,
            xml_type: self.xml_type.ok_or_else(|| illegal("xml type is required"))?,
            marshaller: self.marshaller.ok_or_else(|| illegal("marshaller is required"))?,
        })
    }
}
