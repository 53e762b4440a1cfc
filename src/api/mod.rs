mod error;
pub mod health;
pub mod hints;
pub mod images;

pub use error::ApiError;
