//! Hardware display backends for Wayland compositors.
//!
//! The crate discovers GPUs and input devices, drives kernel mode-setting through the DRM atomic
//! API and hands outputs and input devices to the compositor through the [`backend::Backend`]
//! interface.

#[macro_use]
extern crate tracing;

pub mod backend;
pub mod buffer;
pub mod output;
pub mod render;
pub mod utils;

pub use kiln_config as config;
