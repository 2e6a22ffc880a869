// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-connection metadata.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::Span;
use uuid::Uuid;

/// Metadata of one accepted client connection, shared by every request on it.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
    /// Whether the client reached us over the TLS listener.
    pub secure: bool,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
            secure: false,
        }
    }

    pub fn over_tls(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    /// Span every log line of this connection is recorded under.
    pub fn span(&self) -> Span {
        tracing::info_span!("conn", id = %self.id, remote = %self.remote_addr, tls = self.secure)
    }
}
