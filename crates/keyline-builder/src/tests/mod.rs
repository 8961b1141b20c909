//! Tests for the keyline-builder crate.

mod helpers;
