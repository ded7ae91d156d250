pub mod common;
pub mod configmap;
pub mod deployment;
pub mod exec;
pub mod repmgr_db;
pub mod secret;
pub mod service;
pub mod volume;
