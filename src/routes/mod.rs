pub mod catalog;
pub mod class_sessions;
pub mod cron;
pub mod discounts;
pub mod enrollments;
pub mod health;
pub mod metrics;
pub mod payments;
pub mod progress;
pub mod registrations;
