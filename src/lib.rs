pub mod app;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod metadata;
pub mod openbis;
pub mod output;
pub mod reconcile;
pub mod relations;
pub mod upload;
