pub mod boundaries;
pub mod errors;
pub mod gateways;
pub mod interactors;
pub mod models;
pub mod progress;
pub mod utils;
pub mod validation;
