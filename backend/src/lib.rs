pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod persistence;
pub mod repositories;
pub mod services;
pub mod state;
pub mod types;
pub mod utils;
