//! Client transports for the event hub.

pub mod unix;

pub use unix::{UnixClient, UnixServer};
