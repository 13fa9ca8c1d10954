//! Domain logic for the wellness voice-call service.
//!
//! This crate is deliberately free of web-framework and database
//! dependencies so the scoring rules can be exercised in isolation by the
//! service crate and its tests.

pub mod sentiment;
