//! TLS material for the host/agent channel.

use crate::error::{CoreError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// PEM encoded certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert: String,
    pub key: String,
}

/// Generate a self-signed certificate for `common_name`.
pub fn generate_certificate(common_name: &str) -> Result<CertificatePair> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .map_err(|e| CoreError::Certificate(format!("invalid subject {common_name:?}: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "kestrel");
    params.distinguished_name = dn;

    let key = KeyPair::generate()
        .map_err(|e| CoreError::Certificate(format!("key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| CoreError::Certificate(format!("signing failed: {e}")))?;

    Ok(CertificatePair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Load `<dir>/<prefix>.crt` and `<dir>/<prefix>.key`, generating and
/// writing them first when either is missing. The key is written 0600.
pub async fn ensure_certificate_pair(
    dir: &Path,
    prefix: &str,
    common_name: &str,
) -> Result<CertificatePair> {
    let cert_path = dir.join(format!("{prefix}.crt"));
    let key_path = dir.join(format!("{prefix}.key"));

    if cert_path.exists() && key_path.exists() {
        return Ok(CertificatePair {
            cert: tokio::fs::read_to_string(&cert_path).await?,
            key: tokio::fs::read_to_string(&key_path).await?,
        });
    }

    tracing::debug!(path = %cert_path.display(), common_name = %common_name, "Generating certificate");
    let pair = generate_certificate(common_name)?;
    tokio::fs::write(&cert_path, &pair.cert).await?;
    tokio::fs::write(&key_path, &pair.key).await?;
    tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(pair)
}
