pub mod config;
pub mod image_reference;
pub mod license;
pub mod proxy;
pub mod readiness;
pub mod secret_string;
pub mod state;
pub mod webserver;
