//! Database connection and initialization.

pub use agentforge_core::db::DatabaseError;

agentforge_core::define_database!(Database, "Database migrations complete");
