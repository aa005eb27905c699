//! Database queries

pub mod import_session;
pub mod shareholder;
