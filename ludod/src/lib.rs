pub mod config;
pub mod daemon;
pub mod repository;
pub mod sync;
