pub mod audit;
pub mod capacity;
pub mod catalog;
pub mod discounts;
pub mod dunning;
pub mod email;
pub mod enrollment;
pub mod fees;
pub mod metrics;
pub mod payments;
pub mod progress;
pub mod registrations;
pub mod scheduler;
