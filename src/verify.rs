//! Validating server certificates.
//!
//! How strictly a certificate is checked depends on what is known about the
//! server:
//!
//! * With a name, the chain has to lead to one of the trust anchors and the
//!   certificate has to be valid for the name.
//! * With pins, one certificate of the presented chain has to carry a
//!   public key whose SHA-256 digest is pinned. The chain still has to be
//!   consistent, but it may end in an unknown root.
//! * With neither, the server is used opportunistically. Its certificate
//!   only has to parse.
//!
//! The handshake signatures are verified in all cases, so the server has to
//! hold the private key for the certificate it presents.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::BTreeSet;
use std::sync::Arc;

use ring::digest;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::{
    verify_server_cert_signed_by_trust_anchor, verify_server_name,
};
use tokio_rustls::rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{
    CertificateError, DigitallySignedStruct, Error as TlsError,
    RootCertStore, SignatureScheme,
};
use tracing::debug;

use crate::server::ServerIdentity;

//------------ ServerVerifier -------------------------------------------------

/// Certificate verifier for a single server.
#[derive(Debug)]
pub struct ServerVerifier {
    /// The trust anchors.
    roots: Arc<RootCertStore>,

    /// Whether the certificate must be valid for the server name.
    check_name: bool,

    /// Accepted SPKI digests. Empty if the server isn't pinned.
    pins: BTreeSet<Vec<u8>>,

    /// Signature algorithms of the crypto provider.
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerVerifier {
    /// Creates a verifier for the given server.
    pub fn new(
        server: &ServerIdentity,
        roots: Arc<RootCertStore>,
        algorithms: WebPkiSupportedAlgorithms,
    ) -> Self {
        Self {
            roots,
            check_name: server.name().is_some(),
            pins: server.fingerprints().clone(),
            algorithms,
        }
    }

    /// Returns whether the certificate is checked at all.
    fn is_opportunistic(&self) -> bool {
        !self.check_name && self.pins.is_empty()
    }

    /// Checks that one certificate of the chain has a pinned key.
    fn check_pins(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), TlsError> {
        let pinned = std::iter::once(end_entity)
            .chain(intermediates)
            .filter_map(|cert| spki_digest(cert))
            .any(|digest| self.pins.contains(&digest));
        if pinned {
            Ok(())
        } else {
            debug!("no pinned public key in certificate chain");
            Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl ServerCertVerifier for ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        if self.is_opportunistic() {
            return Ok(ServerCertVerified::assertion());
        }

        match verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        ) {
            Ok(()) => {}
            // A pinned server may use a private root.
            Err(TlsError::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )) if !self.pins.is_empty() => {
                debug!("ignoring unknown issuer of pinned server");
            }
            Err(err) => return Err(err),
        }

        if self.check_name {
            verify_server_name(&cert, server_name)?;
        }
        if !self.pins.is_empty() {
            self.check_pins(end_entity, intermediates)?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

//------------ spki_digest ----------------------------------------------------

/// Returns the SHA-256 digest of a certificate's subject public key info.
///
/// This is the value servers are pinned with. Returns `None` if the
/// certificate cannot be parsed.
pub fn spki_digest(cert: &CertificateDer<'_>) -> Option<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let spki = cert.tbs_certificate.subject_pki.raw;
    Some(digest::digest(&digest::SHA256, spki).as_ref().to_vec())
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, CertifiedKey, IsCa, KeyPair,
    };
    use tokio_rustls::rustls::crypto::ring::default_provider;

    const NAME: &str = "dns.example.com";

    /// A leaf certificate for `NAME` and the CA that issued it.
    struct Chain {
        ca: CertificateDer<'static>,
        leaf: CertificateDer<'static>,
    }

    fn chain() -> Chain {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).unwrap();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec![NAME.into()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();
        Chain {
            ca: ca.der().clone(),
            leaf: leaf.der().clone(),
        }
    }

    fn roots(anchors: &[&CertificateDer<'static>]) -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for anchor in anchors {
            roots.add((*anchor).clone()).unwrap();
        }
        Arc::new(roots)
    }

    fn verify(
        server: &ServerIdentity,
        roots: Arc<RootCertStore>,
        chain: &[CertificateDer<'static>],
    ) -> Result<ServerCertVerified, TlsError> {
        let verifier = ServerVerifier::new(
            server,
            roots,
            default_provider().signature_verification_algorithms,
        );
        let name = ServerName::try_from(NAME).unwrap();
        verifier.verify_server_cert(
            &chain[0],
            &chain[1..],
            &name,
            &[],
            UnixTime::now(),
        )
    }

    fn server() -> ServerIdentity {
        ServerIdentity::new("192.0.2.1:853".parse().unwrap())
    }

    #[test]
    fn named_server() {
        let chain = chain();
        let server = server().with_name(NAME);
        assert!(verify(&server, roots(&[&chain.ca]), &[chain.leaf]).is_ok());
    }

    #[test]
    fn named_server_wrong_name() {
        let chain = chain();
        let server = server().with_name("dns.example.org");
        let verifier = ServerVerifier::new(
            &server,
            roots(&[&chain.ca]),
            default_provider().signature_verification_algorithms,
        );
        let name = ServerName::try_from("dns.example.org").unwrap();
        let res = verifier.verify_server_cert(
            &chain.leaf,
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(matches!(res, Err(TlsError::InvalidCertificate(_))));
    }

    #[test]
    fn named_server_unknown_issuer() {
        let chain = chain();
        let server = server().with_name(NAME);
        let res = verify(&server, roots(&[]), &[chain.leaf]);
        assert!(matches!(
            res,
            Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer))
        ));
    }

    #[test]
    fn pinned_leaf() {
        let chain = chain();
        let pin = spki_digest(&chain.leaf).unwrap();
        let server = server().with_fingerprint(pin);
        assert!(verify(&server, roots(&[]), &[chain.leaf]).is_ok());
    }

    #[test]
    fn pinned_intermediate() {
        let chain = chain();
        let pin = spki_digest(&chain.ca).unwrap();
        let server = server().with_fingerprint(pin);
        assert!(verify(&server, roots(&[]), &[chain.leaf, chain.ca]).is_ok());
    }

    #[test]
    fn pin_mismatch() {
        let chain = chain();
        let other = chain_other_leaf();
        let server = server()
            .with_fingerprint(spki_digest(&other).unwrap())
            .with_fingerprint(vec![0; 32]);
        let res = verify(&server, roots(&[&chain.ca]), &[chain.leaf]);
        assert!(matches!(
            res,
            Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
    }

    #[test]
    fn opportunistic() {
        let chain = chain();
        assert!(verify(&server(), roots(&[]), &[chain.leaf]).is_ok());

        let CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["other.example".into()])
                .unwrap();
        assert!(verify(&server(), roots(&[]), &[cert.der().clone()]).is_ok());

        let garbage = CertificateDer::from(vec![0x30, 0x03, 1, 2, 3]);
        assert!(verify(&server(), roots(&[]), &[garbage]).is_err());
    }

    #[test]
    fn digests_are_sha256() {
        let chain = chain();
        let digest = spki_digest(&chain.leaf).unwrap();
        assert_eq!(digest.len(), 32);
        assert_ne!(Some(digest), spki_digest(&chain.ca));
        assert!(spki_digest(&CertificateDer::from(vec![1, 2, 3])).is_none());
    }

    fn chain_other_leaf() -> CertificateDer<'static> {
        chain().leaf
    }
}
