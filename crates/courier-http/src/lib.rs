// SPDX-License-Identifier: AGPL-3.0
// Courier HTTP - Network side of Courier
//
// This crate provides:
// - HttpTransport, the reqwest-backed Transport the manager drives
// - An axum upload server to test the standard-server backend against

pub mod client;
pub mod server;

pub use client::HttpTransport;
pub use server::{create_router, sanitize_file_name, serve, start_server, ServerState, UploadReply};
