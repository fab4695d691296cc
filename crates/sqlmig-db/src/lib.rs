pub mod migrations;
pub mod migrator;
pub mod store;

pub use migrations::{MigrationRecord, Section};
pub use migrator::{ApplyEvent, ApplyReport, MigrationFailure, Migrator, RollbackOutcome};
pub use store::{AppliedMigration, MigrationStore, PendingMigration};
