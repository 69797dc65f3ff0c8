mod versioned_schema;

pub use versioned_schema::{
    initialize_schema, Column, ForeignKey, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
};
