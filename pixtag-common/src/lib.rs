//! # Pixtag Common Library
//!
//! Shared code for the pixtag services:
//! - Product catalog snapshots and the dedup selector
//! - Output type descriptions, the schema compiler and response validation
//! - Results store (append-only classification records)
//! - Task queue abstraction and its SQLite implementation
//! - Callback authentication, configuration loading and database setup

pub mod api;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod queue;
pub mod results;
pub mod schema;
pub mod selector;

pub use error::{Error, Result};
pub use model::{ClassificationTask, ImageMetadata, ImageRef, ImageRole, Product};
pub use schema::{compile, OutputSchema, TypeDescription};
