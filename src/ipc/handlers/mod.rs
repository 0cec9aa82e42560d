pub mod accounts;
pub mod backup_exchange;
pub mod colleges;
pub mod core;
pub mod data;
pub mod departments;
pub mod fees;
pub mod reports;
pub mod rooms;
pub mod setup;
pub mod students;
