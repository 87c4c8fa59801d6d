//! Shared type definitions
//!
//! This module contains the data types shared between the engine and the chat runner.

pub mod message;
