//! Transcription job dispatch
//!
//! Decouples the component that accepts transcription requests from the
//! workers that run the engine. Jobs travel over a durable stream with
//! consumer-group semantics, inputs are staged in a shared blob area, and
//! each result is routed back to the exact caller awaiting it.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
