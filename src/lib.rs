//! rtp-playout library - RTP receive stream with an adaptive jitter buffer
//!
//! This module exports internal components for integration testing.

pub mod cli;
pub mod config;
pub mod health;
pub mod rtp;
