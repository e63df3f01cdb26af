pub mod decoder;
pub mod driver;
pub mod host;
pub mod incoming;
