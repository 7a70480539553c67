pub mod actions;
pub mod device_backend;
pub mod generic_types;
pub mod realtime_api;
