mod api;
mod client;
mod error;
mod message;
pub mod retry;
pub mod tm;
mod transaction;
mod undo;

pub use api::*;
pub use client::*;
pub use error::*;
pub use message::*;
pub use transaction::*;
pub use undo::*;
