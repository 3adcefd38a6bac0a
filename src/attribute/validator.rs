use regex::Regex;

use crate::error::{EngineError, EngineResult};

use super::{AttributeDefinition, ValueMarshaller};

/// Optional `CC/CC/` prefix followed by up to 256 non-blank characters.
pub const UNIQUE_IDENTIFIER_PATTERN: &str = r"^(([A-Z]{2}/){2})?\S{0,256}$";

/// Checks marshalled values before they are sent or accepted.
#[derive(Debug, Clone)]
pub struct AttributeValueValidator {
    active: bool,
    max_string_length: usize,
    identifier: Regex,
}

impl AttributeValueValidator {
    pub fn new(active: bool, max_string_length: usize) -> EngineResult<Self> {
        let identifier = Regex::new(UNIQUE_IDENTIFIER_PATTERN)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        Ok(Self {
            active,
            max_string_length,
            identifier,
        })
    }

    pub fn is_valid(&self, definition: &AttributeDefinition, marshalled: &str) -> bool {
        if !self.active {
            return true;
        }
        match definition.marshaller() {
            ValueMarshaller::LiteralString if definition.is_unique_identifier() => {
                self.identifier.is_match(marshalled)
            }
            ValueMarshaller::LiteralString | ValueMarshaller::String => {
                marshalled.chars().count() <= self.max_string_length
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::catalog::{legal, natural};

    #[test]
    fn can_validate_unique_identifier() {
        let validator = AttributeValueValidator::new(true, 20).unwrap();
        let identifier = natural::person_identifier();
        assert!(validator.is_valid(&identifier, "ES/AT/02635542Y"));
        assert!(validator.is_valid(&identifier, "12345"));
        assert!(!validator.is_valid(&identifier, "ES/AT/0263 5542Y"));
        assert!(!validator.is_valid(&identifier, &"X".repeat(257)));
        assert!(validator.is_valid(&legal::legal_person_identifier(), "BE/BE/0123456789"));
    }

    #[test]
    fn can_limit_string_length() {
        let validator = AttributeValueValidator::new(true, 5).unwrap();
        let name = natural::current_given_name();
        assert!(validator.is_valid(&name, &"Javier"[..5]));
        assert!(!validator.is_valid(&name, "Javier"));
    }

    #[test]
    fn can_skip_when_inactive() {
        let validator = AttributeValueValidator::new(false, 1).unwrap();
        assert!(validator.is_valid(&natural::current_given_name(), "Javier"));
        assert!(validator.is_valid(&natural::person_identifier(), "a b"));
    }
}
