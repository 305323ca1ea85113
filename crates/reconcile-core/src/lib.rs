pub mod alerts;
pub mod config;
pub mod dashboard;
pub mod execution;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod sqlite;
