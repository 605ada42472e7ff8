//! Local TCP forwarding daemon with runtime target switching and
//! self-healing.

pub mod config;
pub mod controller;
pub mod proxy;

pub use controller::ConfigController;
pub use proxy::{
    ChannelSink, EventSink, HealthConfig, LogSink, ProxyError, ProxyEvent, ProxyServer,
    ServerOptions, ServerState, Tee,
};
