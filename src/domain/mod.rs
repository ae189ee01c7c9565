pub mod models;
pub mod pairing;
pub mod settings;
