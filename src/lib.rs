pub mod api;
pub mod app;
pub mod attribution;
pub mod config;
pub mod events;
pub mod matching;
pub mod models;
pub mod redirect;
pub mod storage;
pub mod visitor;
