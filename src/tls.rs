use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::{
  fs::File,
  io::{self, BufReader, ErrorKind::InvalidData},
  path::Path,
};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};

/// Builds the listener's TLS configuration from a PEM certificate chain and a PEM private key.
pub fn server_config<P1, P2>(certificate_path: P1, private_key_path: P2) -> Result<ServerConfig, io::Error>
where
  P1: AsRef<Path>,
  P2: AsRef<Path>,
{
  let certificates = load_certs(&certificate_path)?;
  let private_key = load_key(&private_key_path)?;
  ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(certificates, private_key)
    .map_err(|e| {
      io::Error::new(
        InvalidData,
        format!(
          "Invalid certificate/key pair '{}', '{}': {}",
          certificate_path.as_ref().display(),
          private_key_path.as_ref().display(),
          e
        ),
      )
    })
}

fn open<P>(path: P) -> io::Result<BufReader<File>>
where
  P: AsRef<Path>,
{
  let file = File::open(&path).map_err(|e| {
    io::Error::new(
      e.kind(),
      format!("Could not open '{}' due to: {}", path.as_ref().display(), e),
    )
  })?;
  Ok(BufReader::new(file))
}

fn load_certs<P>(path: P) -> io::Result<Vec<Certificate>>
where
  P: AsRef<Path>,
{
  let certificates = certs(&mut open(&path)?).map_err(|_| {
    io::Error::new(
      InvalidData,
      format!("Invalid certificate in '{}'", path.as_ref().display()),
    )
  })?;
  if certificates.is_empty() {
    return Err(io::Error::new(
      InvalidData,
      format!("No certificate found in '{}'", path.as_ref().display()),
    ));
  }
  Ok(certificates.into_iter().map(Certificate).collect())
}

fn load_key<P>(path: P) -> io::Result<PrivateKey>
where
  P: AsRef<Path>,
{
  let invalid = || io::Error::new(InvalidData, format!("Invalid private key in '{}'", path.as_ref().display()));

  let mut keys = pkcs8_private_keys(&mut open(&path)?).map_err(|_| invalid())?;
  if keys.is_empty() {
    keys = rsa_private_keys(&mut open(&path)?).map_err(|_| invalid())?;
  }
  keys.into_iter().next().map(PrivateKey).ok_or_else(invalid)
}
