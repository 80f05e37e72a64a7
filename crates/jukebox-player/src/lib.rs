pub mod config;
pub mod decode;
pub mod output;
pub mod player;
pub mod provider;
pub mod resample;
pub mod session;
pub mod sink;
