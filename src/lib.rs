// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP forward proxy with TLS interception.
//!
//! Plain requests are rewritten and forwarded once. CONNECT requests are
//! intercepted: the client's TLS is terminated with a leaf minted by the
//! local root CA, and every decrypted request is rewritten and re-issued to
//! the real origin.

pub mod body;
pub mod ca;
pub mod cert_store;
pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod headers;
pub mod io;
pub mod proxy;
pub mod tls;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
mod test_helpers;

// Keep library small; main.rs remains the binary entrypoint.
