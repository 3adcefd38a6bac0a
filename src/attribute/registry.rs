use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

use super::{catalog, AttributeDefinition, XmlType};

/// Immutable set of the attribute definitions known to an engine.
#[derive(Debug, Clone, Default)]
pub struct AttributeRegistry {
    definitions: Vec<AttributeDefinition>,
}

impl AttributeRegistry {
    /// Fails on a repeated name URI, or when one XML type is declared with two
    /// different marshallers.
    pub fn new(definitions: Vec<AttributeDefinition>) -> EngineResult<Self> {
        let mut marshallers: HashMap<&XmlType, _> = HashMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            if definitions[..index]
                .iter()
                .any(|other| other.name_uri() == definition.name_uri())
            {
                return Err(EngineError::Configuration(format!(
                    "attribute {} is defined twice",
                    definition.name_uri()
                )));
            }
            let marshaller = definition.marshaller();
            if let Some(existing) = marshallers.insert(definition.xml_type(), marshaller) {
                if existing != marshaller {
                    return Err(EngineError::Configuration(format!(
                        "xml type {} has conflicting marshallers",
                        definition.xml_type()
                    )));
                }
            }
        }
        Ok(Self { definitions })
    }

    /// Registry of the eIDAS natural, legal and representative data sets.
    pub fn eidas() -> Self {
        Self {
            definitions: catalog::all(),
        }
    }

    pub fn get_by_name(&self, name_uri: &str) -> Option<&AttributeDefinition> {
        self.definitions.iter().find(|d| d.name_uri() == name_uri)
    }

    pub fn get_by_friendly_name(&self, friendly_name: &str) -> Vec<&AttributeDefinition> {
        self.get_by_filter(|d| d.friendly_name() == friendly_name)
    }

    pub fn get_by_filter<F>(&self, mut filter: F) -> Vec<&AttributeDefinition>
    where
        F: FnMut(&AttributeDefinition) -> bool,
    {
        self.definitions.iter().filter(|d| filter(d)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Registry holding the definitions of both, `self` winning on clashes.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut definitions = self.definitions.clone();
        for definition in &other.definitions {
            if self.get_by_name(definition.name_uri()).is_none() {
                definitions.push(definition.clone());
            }
        }
        Self { definitions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{catalog::natural, PersonType, ValueMarshaller};

    #[test]
    fn can_lookup_eidas_definitions() {
        let registry = AttributeRegistry::eidas();
        let definition = registry.get_by_name(natural::CURRENT_GIVEN_NAME).unwrap();
        assert_eq!(definition.friendly_name(), "FirstName");
        assert_eq!(registry.get_by_friendly_name("Gender").len(), 1);
        assert_eq!(
            registry
                .get_by_filter(|d| d.person_type() == PersonType::NaturalPerson)
                .len(),
            8
        );
        assert!(registry.get_by_name("urn:unknown").is_none());
    }

    #[test]
    fn can_reject_duplicate_definition() {
        let result = AttributeRegistry::new(vec![natural::gender(), natural::gender()]);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn can_reject_conflicting_marshallers() {
        let conflicting = AttributeDefinition::builder("http://example.ms/attributes/Gender2")
            .friendly_name("Gender2")
            .person_type(PersonType::NaturalPerson)
            .xml_type(natural::gender().xml_type().clone())
            .marshaller(ValueMarshaller::String)
            .build()
            .unwrap();
        assert!(AttributeRegistry::new(vec![natural::gender(), conflicting]).is_err());
    }

    #[test]
    fn can_merge_registries() {
        let extra = AttributeDefinition::builder("http://example.ms/attributes/ShoeSize")
            .friendly_name("ShoeSize")
            .person_type(PersonType::NaturalPerson)
            .xml_type(XmlType::new("http://example.ms/attributes", "ShoeSizeType", "ms"))
            .marshaller(ValueMarshaller::String)
            .build()
            .unwrap();
        let custom = AttributeRegistry::new(vec![extra, natural::gender()]).unwrap();
        let merged = AttributeRegistry::eidas().merge(&custom);
        assert_eq!(merged.len(), AttributeRegistry::eidas().len() + 1);
    }
}
