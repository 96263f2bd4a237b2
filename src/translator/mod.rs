// Rewrites applied to proposed SQL before it is validated

pub mod lexical;
mod table_qualifier;
mod qualifier_stripper;
mod enum_synonym_normalizer;

pub use table_qualifier::TableQualifier;
pub use qualifier_stripper::QualifierStripper;
pub use enum_synonym_normalizer::EnumSynonymNormalizer;
