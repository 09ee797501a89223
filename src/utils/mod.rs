//! Shared utility functions for memo-forge.
//!
//! This module provides common utilities used across multiple modules,
//! including JSON extraction from LLM responses.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, code_blocks, extract_json, longest_json_value, JsonStructureAnalysis,
};
