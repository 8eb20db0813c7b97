//! Core of the pressy feed reader.
//!
//! A single shared [`document::Document`] holds the feed collection. The
//! foreground [`controller::Controller`] mutates it, a detached
//! [`server`] worker reads it, and the [`shutdown::ShutdownCoordinator`]
//! persists it once no background update is in flight.

pub mod config;
pub mod controller;
pub mod document;
pub mod feed;
pub mod progress;
pub mod server;
pub mod shutdown;
