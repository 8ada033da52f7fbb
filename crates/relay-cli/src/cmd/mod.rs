pub mod config;
pub mod device;
pub mod edge;
pub mod event;
pub mod serve;
