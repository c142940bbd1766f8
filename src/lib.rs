//! Polybot engine library.
//!
//! Real-time prediction-market trading: a WebSocket-fed tick router
//! fanning events to concurrent strategies, an execution pipeline with
//! pre-trade safety gates and paper/live order routing, and an
//! authoritative state manager with durable accounting.
//!
//! Exposed as a library so the daemon binary and integration tests share
//! the same components.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod execution;
pub mod gateway;
pub mod models;
pub mod router;
pub mod state;
pub mod strategy;
