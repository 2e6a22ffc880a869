// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use crate::error::ProxyError;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
    PKCS_ECDSA_P384_SHA384,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::info;

/// Lifetime of every minted leaf.
pub const LEAF_MAX_AGE: Duration = Duration::hours(24);

/// Backdating applied to `not_before` so slightly skewed clients accept the leaf.
pub const CLOCK_SKEW: Duration = Duration::hours(1);

/// The proxy's root CA: signing key plus the parsed certificate.
pub struct RootCredential {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    is_ca: bool,
}

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCredential")
            .field("is_ca", &self.is_ca)
            .finish_non_exhaustive()
    }
}

impl RootCredential {
    /// Reads the CA certificate and PKCS#8 key from disk.
    ///
    /// Missing files, unparsable PEM or a certificate without `CA:true` are
    /// all startup errors.
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ProxyError> {
        info!("loading CA from {:?}", cert_path);
        let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
            ProxyError::Config(format!("failed to read CA cert {}: {e}", cert_path.display()))
        })?;
        let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
            ProxyError::Config(format!("failed to read CA key {}: {e}", key_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let root = Self::parse(cert_pem, key_pem)?;
        if !root.is_ca {
            return Err(ProxyError::NotACertificateAuthority);
        }
        Ok(root)
    }

    /// Parses without insisting on the CA flag.
    pub(crate) fn parse(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::Config("no certificate found in CA PEM".into()))?
            .map_err(|e| ProxyError::Config(format!("failed to parse CA cert PEM: {e}")))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|e| ProxyError::Config(format!("failed to parse CA cert: {e}")))?;
        let is_ca = parsed.is_ca();

        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Config(format!("failed to parse CA key pair: {e}")))?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| ProxyError::Config(format!("failed to read issuer from CA cert: {e}")))?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
            is_ca,
        })
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Mints a leaf for `hostnames`, the first of which becomes the subject CN.
    pub fn issue_leaf(&self, hostnames: &[String]) -> Result<IssuedLeaf, ProxyError> {
        self.issue_leaf_at(hostnames, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_leaf_at(
        &self,
        hostnames: &[String],
        now: OffsetDateTime,
    ) -> Result<IssuedLeaf, ProxyError> {
        if !self.is_ca {
            return Err(ProxyError::NotACertificateAuthority);
        }
        let common_name = hostnames
            .first()
            .ok_or_else(|| ProxyError::Signing("no hostnames to certify".into()))?;

        let mut serial = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut serial)
            .map_err(|e| ProxyError::Signing(format!("random source failed: {e}")))?;
        // keep the DER integer positive and within 128 bits
        serial[0] &= 0x7f;

        let not_before = now - CLOCK_SKEW;
        let not_after = not_before + LEAF_MAX_AGE;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.as_str());
        for name in hostnames {
            let san = match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(name.as_str().try_into()?),
            };
            params.subject_alt_names.push(san);
        }

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;
        let cert_der = cert.der().clone();

        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signer = any_supported_type(&key_der)
            .map_err(|e| ProxyError::Signing(format!("failed to create leaf key signer: {e}")))?;
        let certified_key = Arc::new(CertifiedKey::new(
            vec![cert_der.clone(), self.cert_der.clone()],
            signer,
        ));

        Ok(IssuedLeaf {
            hostnames: hostnames.to_vec(),
            serial: serial.to_vec(),
            not_before,
            not_after,
            cert_der,
            certified_key,
        })
    }

    /// Creates a self-signed root, returning `(cert_pem, key_pem)`.
    pub fn generate_pem(common_name: &str) -> Result<(String, String), ProxyError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "mitm-proxy");

        // Valid for 10 years
        let not_before = OffsetDateTime::now_utc() - CLOCK_SKEW;
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Writes a fresh root to disk. Existing files are never overwritten.
    pub async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<(), ProxyError> {
        for path in [cert_path, key_path] {
            if fs::try_exists(path).await? {
                return Err(ProxyError::Config(format!(
                    "refusing to overwrite existing {}",
                    path.display()
                )));
            }
        }

        let (cert_pem, key_pem) = Self::generate_pem("mitm-proxy CA")?;
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
        }
        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;
        info!("generated CA at {:?}", cert_path);
        Ok(())
    }
}

/// A leaf certificate and its key, ready to hand to rustls.
#[derive(Debug)]
pub struct IssuedLeaf {
    hostnames: Vec<String>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    cert_der: CertificateDer<'static>,
    certified_key: Arc<CertifiedKey>,
}

impl IssuedLeaf {
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}
