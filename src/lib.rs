pub mod api;
pub mod clock;
pub mod config;
pub mod counter;
pub mod models;
pub mod storage;
pub mod visitor;
