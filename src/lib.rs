//! Delne - a self-hosted reverse proxy and container lifecycle manager
//!
//! This library provides:
//! - Host and path prefix routing to managed containers or static URLs
//! - Lazily built, cached proxy handlers per route
//! - A service lifecycle (pull, create, start, stop, rebuild, delete) over Docker
//! - SQLite persistence for services and images
//! - A JSON administration API served under a path prefix

pub mod admin;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod routing;
