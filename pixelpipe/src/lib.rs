//! Staged image pipeline with a content-addressed pixel cache.
//!
//! A [`Pipeline`] is an ordered list of [`Node`]s, each wrapping a
//! [`Module`]. Every run plans ROIs and hashes for all nodes, then evaluates
//! the chain tail first. Node outputs live in a shared [`PixelCache`] keyed
//! by the hash of everything upstream, so unchanged prefixes of the chain are
//! never computed twice. GPU work goes through a [`DeviceLayer`] and falls
//! back to the CPU on any failure.

mod arena;
mod blend;
mod buffer;
mod cache;
mod colorspace;
mod config;
mod context;
mod controller;
mod device;
mod error;
mod executor;
mod module;
mod node;
mod pipeline;
mod planner;
mod roi;
mod sampling;
mod sidecar;
mod source;
mod tiling;

pub mod prelude;

pub use prelude::*;

#[cfg(test)]
mod tests;
