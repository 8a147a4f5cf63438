//! Service layer shared by the API and CLI.

mod entity_service;

pub use entity_service::EntityService;
