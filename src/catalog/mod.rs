// Schema introspection, derived indexes and the refreshable snapshot cache
pub mod cache;
pub mod introspect;
pub mod prompt;
pub mod snapshot;
pub mod synonyms;

pub use cache::{CatalogState, CatalogStats, SchemaCatalog};
pub use introspect::{CatalogDiagnostics, PgSchemaLoader, SchemaLoader, StaticSchemaLoader};
pub use snapshot::{CatalogRow, ColumnInfo, EnumColumn, EnumIndex, SchemaSnapshot, TableIndex, TableInfo};
pub use synonyms::SynonymTable;
