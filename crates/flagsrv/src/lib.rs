//! Flag submission server library - wired together by `main.rs`, exported
//! for the integration tests.

pub mod cache;
pub mod checker;
pub mod config;
pub mod context;
pub mod coord;
pub mod db;
pub mod ipmap;
pub mod net;
pub mod stats;
pub mod strpool;
