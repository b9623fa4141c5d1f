//! Shared type definitions
//!
//! This module contains the request and configuration types used across the crate.

pub mod config;
pub mod request;

pub use config::{Device, DevicePreference};
pub use request::{GenerationRequest, GenerationRequestBuilder, ValidationError};
