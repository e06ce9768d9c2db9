pub mod canonical;
pub mod clock;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod duration;
pub mod oci_registry;
pub mod reconciler;
pub mod resource;
pub mod scan_cache;
pub mod scanner;
pub mod schedule;
pub mod state;
pub mod store;
pub mod webserver;
