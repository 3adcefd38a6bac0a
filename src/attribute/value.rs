use std::{fmt, str::FromStr};

use time::Date;

use crate::error::{EngineError, EngineResult};

use super::AttributeDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
    Unspecified,
}

impl Gender {
    #[must_use]
    pub const fn value(&self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
            Self::Unspecified => "Unspecified",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

impl FromStr for Gender {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Male" => Ok(Self::Male),
            "Female" => Ok(Self::Female),
            "Unspecified" => Ok(Self::Unspecified),
            other => Err(EngineError::Marshalling(format!("unknown gender {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PostalAddress {
    pub address_id: Option<String>,
    pub po_box: Option<String>,
    pub locator_designator: Option<String>,
    pub locator_name: Option<String>,
    pub cv_address_area: Option<String>,
    pub thoroughfare: Option<String>,
    pub post_name: Option<String>,
    pub admin_unit_first_line: Option<String>,
    pub admin_unit_second_line: Option<String>,
    pub post_code: Option<String>,
    pub full_cv_address: Option<String>,
}

impl PostalAddress {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    String(String),
    Date(Date),
    Gender(Gender),
    PostalAddress(PostalAddress),
}

/// A typed value, optionally flagged as the non-Latin-script alternate of
/// another value of the same attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeValue {
    value: Value,
    non_latin_script_alternate: bool,
}

impl AttributeValue {
    pub fn new(value: Value, non_latin_script_alternate: bool) -> Self {
        Self {
            value,
            non_latin_script_alternate,
        }
    }

    pub fn string(value: &str) -> Self {
        Self::new(Value::String(value.into()), false)
    }

    pub fn non_latin(value: &str) -> Self {
        Self::new(Value::String(value.into()), true)
    }

    pub fn date(value: Date) -> Self {
        Self::new(Value::Date(value), false)
    }

    pub fn gender(value: Gender) -> Self {
        Self::new(Value::Gender(value), false)
    }

    pub fn postal_address(value: PostalAddress) -> Self {
        Self::new(Value::PostalAddress(value), false)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_non_latin_script_alternate(&self) -> bool {
        self.non_latin_script_alternate
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Attribute definitions with their values.
///
/// Definitions are unique by name URI and keep the order they were first
/// added in. There is no way to change a map once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImmutableAttributeMap {
    entries: Vec<(AttributeDefinition, Vec<AttributeValue>)>,
}

impl ImmutableAttributeMap {
    pub fn builder() -> ImmutableAttributeMapBuilder {
        ImmutableAttributeMapBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.entries.iter().map(|(definition, _)| definition)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeDefinition, &[AttributeValue])> {
        self.entries
            .iter()
            .map(|(definition, values)| (definition, values.as_slice()))
    }

    pub fn definition(&self, name_uri: &str) -> Option<&AttributeDefinition> {
        self.definitions().find(|d| d.name_uri() == name_uri)
    }

    pub fn values(&self, name_uri: &str) -> Option<&[AttributeValue]> {
        self.entries
            .iter()
            .find(|(definition, _)| definition.name_uri() == name_uri)
            .map(|(_, values)| values.as_slice())
    }

    pub fn first_value(&self, name_uri: &str) -> Option<&AttributeValue> {
        self.values(name_uri).and_then(|values| values.first())
    }

    pub fn contains(&self, name_uri: &str) -> bool {
        self.definition(name_uri).is_some()
    }

    /// True when the attribute is present with at least one value.
    pub fn has_values(&self, name_uri: &str) -> bool {
        self.values(name_uri).is_some_and(|values| !values.is_empty())
    }

    #[must_use]
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&AttributeDefinition) -> bool,
    {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(definition, _)| keep(definition))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ImmutableAttributeMapBuilder {
    entries: Vec<(AttributeDefinition, Vec<AttributeValue>)>,
}

impl ImmutableAttributeMapBuilder {
    /// Adds values to a definition. Values for a definition already present
    /// are merged, repeated values are dropped.
    pub fn put<I>(mut self, definition: AttributeDefinition, values: I) -> Self
    where
        I: IntoIterator<Item = AttributeValue>,
    {
        let index = match self
            .entries
            .iter()
            .position(|(existing, _)| existing.name_uri() == definition.name_uri())
        {
            Some(index) => index,
            None => {
                self.entries.push((definition, Vec::new()));
                self.entries.len() - 1
            }
        };
        let current = &mut self.entries[index].1;
        for value in values {
            if !current.contains(&value) {
                current.push(value);
            }
        }
        self
    }

    pub fn put_definition(self, definition: AttributeDefinition) -> Self {
        self.put(definition, std::iter::empty())
    }

    pub fn put_all(self, map: &ImmutableAttributeMap) -> Self {
        map.entries.iter().fold(self, |builder, (definition, values)| {
            builder.put(definition.clone(), values.iter().cloned())
        })
    }

    pub fn build(self) -> ImmutableAttributeMap {
        ImmutableAttributeMap {
            entries: self.entries,
        }
    }
}

/// Checks a map holds values of the expected kind for each definition.
pub(crate) fn ensure_values_match(map: &ImmutableAttributeMap) -> EngineResult<()> {
    for (definition, values) in map.iter() {
        for value in values {
            if !definition.marshaller().accepts(value.value()) {
                return Err(EngineError::Marshalling(format!(
                    "{} cannot hold {:?}",
                    definition.name_uri(),
                    value.value()
                )));
            }
        }
    }
    Ok(())
}
