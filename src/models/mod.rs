pub mod auth;
pub mod class_session;
pub mod discount;
pub mod enrollment;
pub mod location;
pub mod program;
pub mod progress;
pub mod registration;
pub mod user;
