use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use ring::digest;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP;
use x509_parser::prelude::{FromDer, X509Certificate};
use yasna::models::ObjectIdentifier;
use yasna::Tag;

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];

const PEM_CERTIFICATE: &str = "CERTIFICATE";
const PEM_RSA_KEY: &str = "RSA PRIVATE KEY";
const PEM_EC_KEY: &str = "EC PRIVATE KEY";
const PEM_PKCS8_KEY: &str = "PRIVATE KEY";

/// Certificate type codes at or above this value never carry stapling.
pub const NO_STAPLING_TYPE: i32 = 100;

pub fn has_stapling(cert_type: i32) -> bool {
    cert_type < NO_STAPLING_TYPE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Ecdsa,
    Rsa,
}

impl KeyClass {
    /// Code sent as the `type` field of a certificate response.
    pub const fn code(self) -> i32 {
        match self {
            KeyClass::Ecdsa => 0,
            KeyClass::Rsa => 1,
        }
    }

    pub fn of(key: &PrivateKeyDer<'_>) -> Result<Self, CodecError> {
        match key {
            PrivateKeyDer::Pkcs1(_) => Ok(KeyClass::Rsa),
            PrivateKeyDer::Sec1(_) => Ok(KeyClass::Ecdsa),
            PrivateKeyDer::Pkcs8(key) => Ok(Pkcs8Key::parse(key.secret_pkcs8_der())?.class),
            _ => Err(CodecError::UnsupportedKey),
        }
    }
}

/// Lowercase hex SHA-256 of the certificate DER.
pub fn fingerprint(leaf: &CertificateDer<'_>) -> String {
    hex::encode(digest::digest(&digest::SHA256, leaf.as_ref()))
}

fn pem_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}

pub fn encode_chain(chain: &[CertificateDer<'_>]) -> String {
    let blocks: Vec<Pem> = chain
        .iter()
        .map(|cert| Pem::new(PEM_CERTIFICATE, cert.as_ref().to_vec()))
        .collect();
    pem::encode_many_config(&blocks, pem_config())
}

/// PEM-encodes a private key as PKCS#1 (RSA) or SEC1 (ECDSA).
pub fn encode_private_key(key: &PrivateKeyDer<'_>) -> Result<(KeyClass, String), CodecError> {
    let (class, block) = match key {
        PrivateKeyDer::Pkcs1(key) => (
            KeyClass::Rsa,
            Pem::new(PEM_RSA_KEY, key.secret_pkcs1_der().to_vec()),
        ),
        PrivateKeyDer::Sec1(key) => (
            KeyClass::Ecdsa,
            Pem::new(PEM_EC_KEY, key.secret_sec1_der().to_vec()),
        ),
        PrivateKeyDer::Pkcs8(key) => {
            let info = Pkcs8Key::parse(key.secret_pkcs8_der())?;
            match info.class {
                KeyClass::Rsa => (KeyClass::Rsa, Pem::new(PEM_RSA_KEY, info.private_key)),
                KeyClass::Ecdsa => {
                    let curve = info.parameters.ok_or(CodecError::MissingCurve)?;
                    let sec1 = sec1_with_curve(&info.private_key, &curve)?;
                    (KeyClass::Ecdsa, Pem::new(PEM_EC_KEY, sec1))
                }
            }
        }
        _ => return Err(CodecError::UnsupportedKey),
    };
    Ok((class, pem::encode_config(&block, pem_config())))
}

/// Collects every `CERTIFICATE` block, in order.
pub fn decode_chain(data: &[u8]) -> Result<Vec<CertificateDer<'static>>, CodecError> {
    let chain: Vec<_> = pem::parse_many(data)?
        .into_iter()
        .filter(|block| block.tag() == PEM_CERTIFICATE)
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if chain.is_empty() {
        return Err(CodecError::MissingCertificate);
    }
    Ok(chain)
}

/// Returns the first private key block, whatever its encoding.
pub fn decode_private_key(data: &[u8]) -> Result<PrivateKeyDer<'static>, CodecError> {
    pem::parse_many(data)?
        .into_iter()
        .find_map(|block| {
            let tag = block.tag().to_owned();
            let key: PrivateKeyDer<'static> = match tag.as_str() {
                PEM_RSA_KEY => PrivatePkcs1KeyDer::from(block.into_contents()).into(),
                PEM_EC_KEY => PrivateSec1KeyDer::from(block.into_contents()).into(),
                PEM_PKCS8_KEY => PrivatePkcs8KeyDer::from(block.into_contents()).into(),
                _ => return None,
            };
            Some(key)
        })
        .ok_or(CodecError::MissingKey)
}

/// Decodes the `cert` and `pkey` fields of a certificate response.
pub fn decode_pem_bundle(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CodecError> {
    Ok((decode_chain(cert_pem)?, decode_private_key(key_pem)?))
}

/// Builds a rustls signing identity from a chain and its key.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<CertifiedKey, CodecError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Metadata of a leaf certificate that the caches care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub not_after: DateTime<Utc>,
    pub ocsp_servers: Vec<String>,
    pub fingerprint: String,
}

impl LeafInfo {
    pub fn parse(leaf: &CertificateDer<'_>) -> Result<Self, CodecError> {
        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|err| CodecError::Certificate(err.to_string()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| CodecError::Certificate("validity out of range".to_owned()))?;
        let mut ocsp_servers = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
                for desc in &aia.accessdescs {
                    if desc.access_method != OID_PKIX_ACCESS_DESCRIPTOR_OCSP {
                        continue;
                    }
                    if let GeneralName::URI(uri) = &desc.access_location {
                        ocsp_servers.push((*uri).to_owned());
                    }
                }
            }
        }
        Ok(Self {
            not_after,
            ocsp_servers,
            fingerprint: fingerprint(leaf),
        })
    }
}

// PrivateKeyInfo ::= SEQUENCE {
//     version         INTEGER,
//     algorithm       AlgorithmIdentifier,
//     privateKey      OCTET STRING,
//     attributes  [0] Attributes OPTIONAL,
//     publicKey   [1] BIT STRING OPTIONAL }
struct Pkcs8Key {
    class: KeyClass,
    parameters: Option<Vec<u8>>,
    private_key: Vec<u8>,
}

impl Pkcs8Key {
    fn parse(der: &[u8]) -> Result<Self, CodecError> {
        let (oid, parameters, private_key) = yasna::parse_der(der, |r| {
            r.read_sequence(|r| {
                let _version = r.next().read_u8()?;
                let (oid, parameters) = r.next().read_sequence(|r| {
                    let oid = r.next().read_oid()?;
                    let parameters = r.read_optional(|r| r.read_der())?;
                    Ok((oid, parameters))
                })?;
                let private_key = r.next().read_bytes()?;
                while r.read_optional(|r| r.read_der())?.is_some() {}
                Ok((oid, parameters, private_key))
            })
        })?;
        let class = if oid == ObjectIdentifier::from_slice(OID_RSA_ENCRYPTION) {
            KeyClass::Rsa
        } else if oid == ObjectIdentifier::from_slice(OID_EC_PUBLIC_KEY) {
            KeyClass::Ecdsa
        } else {
            return Err(CodecError::UnsupportedKey);
        };
        Ok(Self {
            class,
            parameters,
            private_key,
        })
    }
}

// ECPrivateKey ::= SEQUENCE {
//     version        INTEGER { ecPrivkeyVer1(1) },
//     privateKey     OCTET STRING,
//     parameters [0] ECParameters OPTIONAL,
//     publicKey  [1] BIT STRING OPTIONAL }
//
// PKCS#8 wrappers usually drop `parameters`; a standalone SEC1 key needs them.
fn sec1_with_curve(ec_private_key: &[u8], curve: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (secret, public_key) = yasna::parse_der(ec_private_key, |r| {
        r.read_sequence(|r| {
            let _version = r.next().read_u8()?;
            let secret = r.next().read_bytes()?;
            r.read_optional(|r| r.read_tagged(Tag::context(0), |r| r.read_der()))?;
            let public_key =
                r.read_optional(|r| r.read_tagged(Tag::context(1), |r| r.read_der()))?;
            Ok((secret, public_key))
        })
    })?;
    Ok(yasna::construct_der(|w| {
        w.write_sequence(|w| {
            w.next().write_u8(1);
            w.next().write_bytes(&secret);
            w.next().write_tagged(Tag::context(0), |w| w.write_der(curve));
            if let Some(public_key) = &public_key {
                w.next()
                    .write_tagged(Tag::context(1), |w| w.write_der(public_key));
            }
        })
    }))
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("pem error: {0}")]
    Pem(#[from] pem::PemError),
    #[error("asn.1 error: {0}")]
    Asn1(#[from] yasna::ASN1Error),
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("unsupported private key type")]
    UnsupportedKey,
    #[error("ecdsa key without named curve")]
    MissingCurve,
    #[error("no certificate found")]
    MissingCertificate,
    #[error("no private key found")]
    MissingKey,
    #[error("unusable key: {0}")]
    Rustls(#[from] rustls::Error),
}
