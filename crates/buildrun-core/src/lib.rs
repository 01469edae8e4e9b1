//! Core domain types and traits for the buildrun build controller.
//!
//! This crate contains:
//! - The `Build` and `ImageStream` custom resources
//! - Build phases, status reasons and the phase transition table
//! - Object keys and pod naming helpers
//! - Image reference parsing
//! - Collaborator traits (caches, clients, run policies, admission)
//! - An in-memory object cache used by informers and tests

pub mod build;
pub mod cache;
pub mod client;
pub mod error;
pub mod image;
pub mod key;
pub mod pod;
pub mod policy;

pub use build::{
    Build, BuildPhase, BuildSpec, BuildStatus, BuildStrategy, ImageReference, StatusReason,
};
pub use cache::ObjectCache;
pub use error::{Error, Result};
pub use image::ImageStream;
pub use key::ObjectKey;
