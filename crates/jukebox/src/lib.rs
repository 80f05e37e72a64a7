pub mod cli;
pub mod command;
pub mod config;
pub mod hub;
pub mod net;
pub mod providers;
pub mod runtime;
