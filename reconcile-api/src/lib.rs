pub mod api;
pub mod config;
pub mod export;
pub mod handlers;
pub mod prometheus;
pub mod router;
pub mod spreadsheet;
