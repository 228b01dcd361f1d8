use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use asn1_rs::FromDer;
use x509_parser::parse_x509_certificate;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::Error;

/// Default path for the exported (server) and pinned (client) public key.
const DEFAULT_PUBLIC_KEY_FILE: &str = "public.key";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// Build the TLS 1.3-only server config from on-disk PEM material.
/// Also returns the leaf certificate's SubjectPublicKeyInfo DER so the
/// caller can export it for clients to pin.
pub(crate) fn build_server_config(
    cert_file: &str,
    key_file: &str,
) -> Result<(Arc<ServerConfig>, Vec<u8>), Error> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let spki = leaf_spki(&certs[0])?;

    let provider = Arc::new(ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok((Arc::new(config), spki))
}

/// Build the TLS 1.3-only client config trusting exactly the pinned SPKI.
pub(crate) fn build_client_config(pin: Vec<u8>) -> Result<Arc<ClientConfig>, Error> {
    let provider = Arc::new(ring::default_provider());
    let verifier = Arc::new(PinnedKeyVerifier {
        pin,
        provider: provider.clone(),
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Write the SPKI as a `PUBLIC KEY` PEM block for operators to distribute,
/// world-readable.
pub(crate) fn export_public_key(spki: &[u8], dest: &str) -> Result<(), Error> {
    let dest = if dest.trim().is_empty() {
        DEFAULT_PUBLIC_KEY_FILE
    } else {
        dest
    };

    let block = pem::Pem::new(PUBLIC_KEY_TAG, spki);
    let pem_text =
        pem::encode_config(&block, pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF));
    fs::write(dest, pem_text)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

/// Load the pinned SPKI from `source`: either a file path (empty defaults
/// to `public.key`) or an `inline:` literal carrying the PEM text, or the
/// bare base64 SPKI DER. The result is validated as a parseable PKIX
/// public key; a bad pin refuses startup.
pub(crate) fn load_pinned_key(source: &str) -> Result<Vec<u8>, Error> {
    let der = if let Some(literal) = source.strip_prefix("inline:") {
        decode_inline_key(literal)?
    } else {
        let path = if source.trim().is_empty() {
            DEFAULT_PUBLIC_KEY_FILE
        } else {
            source
        };
        let data = fs::read(path)?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Config("public key file is empty".into()));
        }
        decode_public_key_pem(&data)?
    };

    SubjectPublicKeyInfo::from_der(&der)
        .map_err(|_| Error::Config("invalid public key file".into()))?;
    Ok(der)
}

fn decode_public_key_pem(data: &[u8]) -> Result<Vec<u8>, Error> {
    let block =
        pem::parse(data).map_err(|_| Error::Config("failed to parse public key".into()))?;
    if block.tag() != PUBLIC_KEY_TAG {
        return Err(Error::Config("failed to parse public key".into()));
    }
    Ok(block.contents().to_vec())
}

fn decode_inline_key(literal: &str) -> Result<Vec<u8>, Error> {
    let key = literal.trim();
    if key.is_empty() {
        return Err(Error::Config("inline public key is empty".into()));
    }
    if key.starts_with("-----BEGIN") {
        return decode_public_key_pem(key.as_bytes());
    }
    let compact: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|_| Error::Config("failed to parse public key".into()))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = fs::File::open(path)
        .map_err(|e| Error::Config(format!("failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = fs::File::open(path)
        .map_err(|e| Error::Config(format!("failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("failed to parse private key in {path}: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key found in {path}")))
}

/// PKIX SubjectPublicKeyInfo DER of a certificate.
fn leaf_spki(cert: &CertificateDer<'_>) -> Result<Vec<u8>, Error> {
    let (_, parsed) = parse_x509_certificate(cert.as_ref())
        .map_err(|_| Error::Config("failed to parse server certificate".into()))?;
    Ok(parsed.public_key().raw.to_vec())
}

/// Certificate verifier that trusts exactly one public key.
///
/// Chain building, trust anchors, names, and validity windows are not
/// consulted: the leaf SPKI must equal the provisioned pin byte for byte,
/// which lets the server rotate every other certificate field freely as
/// long as the key pair is unchanged. Handshake signatures are still
/// verified, so presenting the pinned certificate without its private key
/// does not pass.
#[derive(Debug)]
struct PinnedKeyVerifier {
    pin: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let (_, cert) = parse_x509_certificate(end_entity.as_ref())
            .map_err(|_| rustls::Error::General("invalid server certificate".into()))?;
        if cert.public_key().raw != self.pin.as_slice() {
            return Err(rustls::Error::General("server public key mismatch".into()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{ALT_CERT_PEM, CERT_PEM, PUBLIC_KEY_PEM};

    fn cert_der(pem_text: &str) -> CertificateDer<'static> {
        let mut reader = BufReader::new(pem_text.as_bytes());
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .unwrap()
            .unwrap();
        cert
    }

    fn pinned_verifier(pin: Vec<u8>) -> PinnedKeyVerifier {
        PinnedKeyVerifier {
            pin,
            provider: Arc::new(ring::default_provider()),
        }
    }

    #[test]
    fn spki_extraction_matches_openssl_output() {
        let spki = leaf_spki(&cert_der(CERT_PEM)).unwrap();
        let expected = pem::parse(PUBLIC_KEY_PEM).unwrap();
        assert_eq!(spki, expected.contents());
    }

    #[test]
    fn verifier_accepts_the_pinned_key_only() {
        let pin = leaf_spki(&cert_der(CERT_PEM)).unwrap();
        let verifier = pinned_verifier(pin);
        let name = ServerName::try_from("localhost").unwrap();

        assert!(verifier
            .verify_server_cert(&cert_der(CERT_PEM), &[], &name, &[], UnixTime::now())
            .is_ok());

        let err = verifier
            .verify_server_cert(&cert_der(ALT_CERT_PEM), &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(matches!(
            err,
            rustls::Error::General(ref msg) if msg == "server public key mismatch"
        ));
    }

    #[test]
    fn export_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("public.key");
        let path = path.to_str().unwrap();

        let spki = leaf_spki(&cert_der(CERT_PEM)).unwrap();
        export_public_key(&spki, path).unwrap();
        assert_eq!(load_pinned_key(path).unwrap(), spki);
    }

    #[test]
    fn missing_pin_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.key");
        assert!(load_pinned_key(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn wrong_pem_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert-as-pin.key");
        fs::write(&path, CERT_PEM).unwrap();

        let err = load_pinned_key(path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse public key");
    }

    #[test]
    fn inline_pem_literal_is_accepted() {
        let pin = load_pinned_key(&format!("inline:{PUBLIC_KEY_PEM}")).unwrap();
        assert_eq!(pin, pem::parse(PUBLIC_KEY_PEM).unwrap().contents());
    }

    #[test]
    fn inline_bare_base64_is_accepted() {
        let body: String = PUBLIC_KEY_PEM
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let pin = load_pinned_key(&format!("inline:{body}")).unwrap();
        assert_eq!(pin, pem::parse(PUBLIC_KEY_PEM).unwrap().contents());
    }

    #[test]
    fn empty_inline_key_is_rejected() {
        let err = load_pinned_key("inline:   ").unwrap_err();
        assert_eq!(err.to_string(), "inline public key is empty");
    }

    #[test]
    fn server_config_is_tls13_only() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        fs::write(&cert_path, CERT_PEM).unwrap();
        fs::write(&key_path, crate::tests::KEY_PEM).unwrap();

        let (config, spki) = build_server_config(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        )
        .unwrap();
        assert_eq!(spki, pem::parse(PUBLIC_KEY_PEM).unwrap().contents());
        assert_eq!(config.alpn_protocols, Vec::<Vec<u8>>::new());
    }
}
