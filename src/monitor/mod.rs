pub mod balance;
pub mod readiness;
