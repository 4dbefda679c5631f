pub mod api_handlers;
pub mod app_state;
pub mod business;
pub mod config;
pub mod element;
pub mod error;
pub mod local_store;
pub mod postgres;
pub mod services;

pub use crate::element::{Enlistment, LocalUnit, ResourceManager};
pub use error::ElementError;
pub use local_store::{LocalDatabase, MemoryDatabase};
