//! SeaORM entities mapping to the rotor's tables.

pub mod account;
