pub mod access;
pub mod commands;
pub mod delivery;
pub mod generate;
pub mod payments;
