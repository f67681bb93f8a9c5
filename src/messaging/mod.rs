pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod frame;
pub mod layers;
pub mod transport;
