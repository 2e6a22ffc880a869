// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Hostname-keyed leaf cache shared by every tunnel.
//!
//! Each hostname owns one [`OnceCell`]; concurrent callers for the same name
//! await the same issuance, while different names never contend beyond the
//! map shard lock held to fetch the cell. The store doubles as the rustls
//! certificate resolver, so handshake-time selection is a keyed lookup.

use crate::ca::{IssuedLeaf, RootCredential};
use crate::error::ProxyError;
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{debug, info};

type LeafCell = Arc<OnceCell<Arc<IssuedLeaf>>>;

pub struct CertificateStore {
    root: Arc<RootCredential>,
    leaves: DashMap<String, LeafCell>,
    issued: AtomicU64,
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hosts", &self.leaves.len())
            .field("issued", &self.issued_count())
            .finish()
    }
}

/// Canonical cache key: lowercase, no trailing dot, no IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl CertificateStore {
    pub fn new(root: Arc<RootCredential>) -> Self {
        Self {
            root,
            leaves: DashMap::new(),
            issued: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &RootCredential {
        &self.root
    }

    /// Returns the cached leaf for `host`, minting it on first use.
    ///
    /// Concurrent calls for one host share a single signing operation. An
    /// expired leaf is evicted and replaced.
    pub async fn get_or_issue(&self, host: &str) -> Result<Arc<IssuedLeaf>, ProxyError> {
        let key = normalize_host(host);
        if key.is_empty() {
            return Err(ProxyError::BadHost(host.to_string()));
        }

        let cell = self.cell_for(&key);
        let leaf = cell
            .get_or_try_init(|| self.issue(key.clone()))
            .await?
            .clone();
        if !leaf.is_expired_at(OffsetDateTime::now_utc()) {
            return Ok(leaf);
        }

        debug!(host = %key, "cached leaf expired, re-issuing");
        // Only drop the cell we observed; a racing caller may already have replaced it.
        self.leaves
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        let fresh = self.cell_for(&key);
        let leaf = fresh
            .get_or_try_init(|| self.issue(key.clone()))
            .await?
            .clone();
        Ok(leaf)
    }

    fn cell_for(&self, key: &str) -> LeafCell {
        if let Some(cell) = self.leaves.get(key) {
            return cell.value().clone();
        }
        self.leaves
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn issue(&self, host: String) -> Result<Arc<IssuedLeaf>, ProxyError> {
        let root = self.root.clone();
        let names = vec![host];
        let leaf = tokio::task::spawn_blocking(move || root.issue_leaf(&names))
            .await
            .map_err(|e| ProxyError::Signing(format!("signing task failed: {e}")))??;
        self.issued.fetch_add(1, Ordering::Relaxed);
        info!(
            hosts = ?leaf.hostnames(),
            not_before = %leaf.not_before(),
            not_after = %leaf.not_after(),
            "issued leaf certificate"
        );
        Ok(Arc::new(leaf))
    }

    /// Completed, unexpired leaf for `name`, if one exists. Never signs.
    pub fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let key = normalize_host(name);
        let leaf = self.leaves.get(&key).and_then(|cell| cell.value().get().cloned())?;
        if leaf.is_expired_at(OffsetDateTime::now_utc()) {
            return None;
        }
        Some(leaf.certified_key())
    }

    /// Number of signing operations performed so far.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn insert_leaf(&self, host: &str, leaf: IssuedLeaf) {
        self.leaves.insert(
            normalize_host(host),
            Arc::new(OnceCell::new_with(Some(Arc::new(leaf)))),
        );
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let found = self.lookup(name);
        if found.is_none() {
            debug!(sni = %name, "no leaf ready for SNI");
        }
        found
    }
}
