pub mod alerts;
pub mod api;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod reservations;
pub mod schema;
pub mod tenant;
pub mod workflow;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
