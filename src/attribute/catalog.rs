//! The eIDAS minimum data sets and their representative variants.

use super::{
    marshaller::{LEGAL_PERSON_ADDRESS_PREFIX, NATURAL_PERSON_ADDRESS_PREFIX},
    AttributeDefinition, PersonType, ValueMarshaller, XmlType,
};

struct Flags {
    required: bool,
    unique_identifier: bool,
    transliteration_mandatory: bool,
}

const OPTIONAL: Flags = Flags {
    required: false,
    unique_identifier: false,
    transliteration_mandatory: false,
};

const REQUIRED: Flags = Flags {
    required: true,
    ..OPTIONAL
};

const IDENTIFIER: Flags = Flags {
    required: true,
    unique_identifier: true,
    transliteration_mandatory: false,
};

const REQUIRED_TRANSLITERATED: Flags = Flags {
    required: true,
    transliteration_mandatory: true,
    ..OPTIONAL
};

const TRANSLITERATED: Flags = Flags {
    transliteration_mandatory: true,
    ..OPTIONAL
};

fn define(
    namespace: (&str, &str),
    person_type: PersonType,
    local_name: &str,
    friendly_name: &str,
    type_name: &str,
    flags: Flags,
    marshaller: ValueMarshaller,
) -> AttributeDefinition {
    let (uri, prefix) = namespace;
    AttributeDefinition {
        name_uri: format!("{uri}/{local_name}"),
        friendly_name: friendly_name.to_string(),
        person_type,
        required: flags.required,
        unique_identifier: flags.unique_identifier,
        transliteration_mandatory: flags.transliteration_mandatory,
        xml_type: XmlType::new(uri, type_name, prefix),
        marshaller,
    }
}

/// Moves a definition into the representative namespace of its person type.
pub fn representative(definition: &AttributeDefinition) -> AttributeDefinition {
    let person_type = match definition.person_type {
        PersonType::LegalPerson | PersonType::RepresentativeLegalPerson => {
            PersonType::RepresentativeLegalPerson
        }
        _ => PersonType::RepresentativeNaturalPerson,
    };
    let rename = |value: &str, base: &str| value.replacen(base, &format!("{base}/representative"), 1);
    let base_uri = definition.xml_type.namespace_uri.as_str();
    AttributeDefinition {
        name_uri: rename(&definition.name_uri, base_uri),
        friendly_name: format!("Representative{}", definition.friendly_name),
        person_type,
        xml_type: XmlType::new(
            &format!("{base_uri}/representative"),
            &definition.xml_type.local_part,
            &format!("{}-representative", definition.xml_type.prefix),
        ),
        ..definition.clone()
    }
}

pub mod natural {
    use super::*;
    use crate::ns::EIDAS_NATURAL;

    const NS: (&str, &str) = (EIDAS_NATURAL, "eidas-natural");

    pub const PERSON_IDENTIFIER: &str = "http://eidas.europa.eu/attributes/naturalperson/PersonIdentifier";
    pub const CURRENT_FAMILY_NAME: &str = "http://eidas.europa.eu/attributes/naturalperson/CurrentFamilyName";
    pub const CURRENT_GIVEN_NAME: &str = "http://eidas.europa.eu/attributes/naturalperson/CurrentGivenName";
    pub const DATE_OF_BIRTH: &str = "http://eidas.europa.eu/attributes/naturalperson/DateOfBirth";
    pub const BIRTH_NAME: &str = "http://eidas.europa.eu/attributes/naturalperson/BirthName";
    pub const PLACE_OF_BIRTH: &str = "http://eidas.europa.eu/attributes/naturalperson/PlaceOfBirth";
    pub const CURRENT_ADDRESS: &str = "http://eidas.europa.eu/attributes/naturalperson/CurrentAddress";
    pub const GENDER: &str = "http://eidas.europa.eu/attributes/naturalperson/Gender";

    fn natural(
        local_name: &str,
        friendly_name: &str,
        type_name: &str,
        flags: Flags,
        marshaller: ValueMarshaller,
    ) -> AttributeDefinition {
        define(
            NS,
            PersonType::NaturalPerson,
            local_name,
            friendly_name,
            type_name,
            flags,
            marshaller,
        )
    }

    pub fn person_identifier() -> AttributeDefinition {
        natural(
            "PersonIdentifier",
            "PersonIdentifier",
            "PersonIdentifierType",
            IDENTIFIER,
            ValueMarshaller::LiteralString,
        )
    }

    pub fn current_family_name() -> AttributeDefinition {
        natural(
            "CurrentFamilyName",
            "FamilyName",
            "CurrentFamilyNameType",
            REQUIRED_TRANSLITERATED,
            ValueMarshaller::String,
        )
    }

    pub fn current_given_name() -> AttributeDefinition {
        natural(
            "CurrentGivenName",
            "FirstName",
            "CurrentGivenNameType",
            REQUIRED_TRANSLITERATED,
            ValueMarshaller::String,
        )
    }

    pub fn date_of_birth() -> AttributeDefinition {
        natural(
            "DateOfBirth",
            "DateOfBirth",
            "DateOfBirthType",
            REQUIRED,
            ValueMarshaller::Date,
        )
    }

    pub fn birth_name() -> AttributeDefinition {
        natural(
            "BirthName",
            "BirthName",
            "BirthNameType",
            TRANSLITERATED,
            ValueMarshaller::String,
        )
    }

    pub fn place_of_birth() -> AttributeDefinition {
        natural(
            "PlaceOfBirth",
            "PlaceOfBirth",
            "PlaceOfBirthType",
            OPTIONAL,
            ValueMarshaller::String,
        )
    }

    pub fn current_address() -> AttributeDefinition {
        natural(
            "CurrentAddress",
            "CurrentAddress",
            "CurrentAddressType",
            OPTIONAL,
            ValueMarshaller::PostalAddress {
                prefix: NATURAL_PERSON_ADDRESS_PREFIX,
            },
        )
    }

    pub fn gender() -> AttributeDefinition {
        natural(
            "Gender",
            "Gender",
            "GenderType",
            OPTIONAL,
            ValueMarshaller::Gender,
        )
    }

    pub fn all() -> Vec<AttributeDefinition> {
        vec![
            person_identifier(),
            current_family_name(),
            current_given_name(),
            date_of_birth(),
            birth_name(),
            place_of_birth(),
            current_address(),
            gender(),
        ]
    }
}

pub mod legal {
    use super::*;
    use crate::ns::EIDAS_LEGAL;

    const NS: (&str, &str) = (EIDAS_LEGAL, "eidas-legal");

    pub const LEGAL_PERSON_IDENTIFIER: &str = "http://eidas.europa.eu/attributes/legalperson/LegalPersonIdentifier";
    pub const LEGAL_NAME: &str = "http://eidas.europa.eu/attributes/legalperson/LegalName";
    pub const LEGAL_ADDRESS: &str = "http://eidas.europa.eu/attributes/legalperson/LegalPersonAddress";
    pub const VAT_REGISTRATION: &str = "http://eidas.europa.eu/attributes/legalperson/VATRegistrationNumber";
    pub const TAX_REFERENCE: &str = "http://eidas.europa.eu/attributes/legalperson/TaxReference";
    pub const EU_IDENTIFIER: &str = "http://eidas.europa.eu/attributes/legalperson/D-2012-17-EUIdentifier";
    pub const LEI: &str = "http://eidas.europa.eu/attributes/legalperson/LEI";
    pub const EORI: &str = "http://eidas.europa.eu/attributes/legalperson/EORI";
    pub const SEED: &str = "http://eidas.europa.eu/attributes/legalperson/SEED";
    pub const SIC: &str = "http://eidas.europa.eu/attributes/legalperson/SIC";

    fn legal(
        local_name: &str,
        friendly_name: &str,
        type_name: &str,
        flags: Flags,
        marshaller: ValueMarshaller,
    ) -> AttributeDefinition {
        define(
            NS,
            PersonType::LegalPerson,
            local_name,
            friendly_name,
            type_name,
            flags,
            marshaller,
        )
    }

    pub fn legal_person_identifier() -> AttributeDefinition {
        legal(
            "LegalPersonIdentifier",
            "LegalPersonIdentifier",
            "LegalPersonIdentifierType",
            IDENTIFIER,
            ValueMarshaller::LiteralString,
        )
    }

    pub fn legal_name() -> AttributeDefinition {
        legal(
            "LegalName",
            "LegalName",
            "LegalNameType",
            REQUIRED_TRANSLITERATED,
            ValueMarshaller::String,
        )
    }

    pub fn legal_address() -> AttributeDefinition {
        legal(
            "LegalPersonAddress",
            "LegalAddress",
            "LegalPersonAddressType",
            OPTIONAL,
            ValueMarshaller::PostalAddress {
                prefix: LEGAL_PERSON_ADDRESS_PREFIX,
            },
        )
    }

    fn literal(local_name: &str, friendly_name: &str, type_name: &str) -> AttributeDefinition {
        legal(
            local_name,
            friendly_name,
            type_name,
            OPTIONAL,
            ValueMarshaller::LiteralString,
        )
    }

    pub fn vat_registration() -> AttributeDefinition {
        literal(
            "VATRegistrationNumber",
            "VATRegistration",
            "VATRegistrationNumberType",
        )
    }

    pub fn tax_reference() -> AttributeDefinition {
        literal("TaxReference", "TaxReference", "TaxReferenceType")
    }

    pub fn eu_identifier() -> AttributeDefinition {
        literal(
            "D-2012-17-EUIdentifier",
            "D-2012-17-EUIdentifier",
            "D-2012-17-EUIdentifierType",
        )
    }

    pub fn lei() -> AttributeDefinition {
        literal("LEI", "LEI", "LEIType")
    }

    pub fn eori() -> AttributeDefinition {
        literal("EORI", "EORI", "EORIType")
    }

    pub fn seed() -> AttributeDefinition {
        literal("SEED", "SEED", "SEEDType")
    }

    pub fn sic() -> AttributeDefinition {
        literal("SIC", "SIC", "SICType")
    }

    pub fn all() -> Vec<AttributeDefinition> {
        vec![
            legal_person_identifier(),
            legal_name(),
            legal_address(),
            vat_registration(),
            tax_reference(),
            eu_identifier(),
            lei(),
            eori(),
            seed(),
            sic(),
        ]
    }
}

/// Every natural and legal definition followed by its representative twin.
pub fn all() -> Vec<AttributeDefinition> {
    let base: Vec<AttributeDefinition> = natural::all().into_iter().chain(legal::all()).collect();
    let representatives: Vec<AttributeDefinition> = base.iter().map(representative).collect();
    base.into_iter().chain(representatives).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_derive_representative_definition() {
        let definition = representative(&natural::person_identifier());
        assert_eq!(
            definition.name_uri(),
            "http://eidas.europa.eu/attributes/naturalperson/representative/PersonIdentifier"
        );
        assert_eq!(definition.friendly_name(), "RepresentativePersonIdentifier");
        assert_eq!(
            definition.person_type(),
            PersonType::RepresentativeNaturalPerson
        );
        assert_eq!(
            definition.xml_type().to_string(),
            "eidas-natural-representative:PersonIdentifierType"
        );
        assert!(definition.is_required());
        assert!(definition.is_unique_identifier());

        let legal = representative(&legal::legal_name());
        assert_eq!(legal.person_type(), PersonType::RepresentativeLegalPerson);
    }

    #[test]
    fn can_list_minimum_data_sets() {
        let all = all();
        assert_eq!(all.len(), 36);
        assert_eq!(
            all.iter().filter(|d| d.is_unique_identifier()).count(),
            4
        );
        assert_eq!(natural::date_of_birth().name_uri(), natural::DATE_OF_BIRTH);
        assert_eq!(legal::legal_address().name_uri(), legal::LEGAL_ADDRESS);
    }
}
