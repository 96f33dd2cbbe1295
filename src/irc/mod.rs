pub mod codec;
pub mod handlers;
pub mod link;
pub mod message;
pub mod metrics;
pub mod resolve;
pub mod topology;
pub mod transport;
