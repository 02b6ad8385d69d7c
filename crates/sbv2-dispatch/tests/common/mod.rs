//! Common test utilities shared across all `sbv2-dispatch` integration tests.
//!
//! This module is **not** a standalone test binary. It is declared with
//! `mod common;` inside each integration test file that needs it.

#![allow(dead_code)]

pub mod mock_backend;

use sbv2_dispatch::{ModelConfig, ModelSource};

/// A model config backed by in-memory bytes
pub fn model(id: &str) -> ModelConfig {
    ModelConfig::new(
        id,
        ModelSource::bytes(b"deberta-weights".to_vec()),
        ModelSource::bytes(b"{\"vocab\":{}}".to_vec()),
    )
}

/// Route `tracing` output through the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sbv2_dispatch=debug")
        .with_test_writer()
        .try_init();
}
