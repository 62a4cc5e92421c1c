pub mod client;
pub mod error;
pub mod model;

pub use client::Client;
pub use error::PinguApiError;
