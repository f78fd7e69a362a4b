//! X.509 certificate and CSR handling on top of openssl.
//!
//! Certificates and CSRs travel as PEM strings through the CA state and the
//! provider interface. The functions here convert from and to those strings,
//! create the certificates the CA needs and check chains.

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{
    X509, X509Builder, X509Name, X509NameBuilder, X509NameRef, X509Ref,
    X509Req, X509ReqBuilder, X509ReqRef, X509StoreContext,
};
use x509_parser::prelude::{
    FromDer, GeneralName, ParsedExtension, X509CertificationRequest,
};
use crate::commons::clock::to_chrono;
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::constants::CERT_BACKDATE;


//------------ KeyType -------------------------------------------------------

/// The kind of private key a CA uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyType {
    Ec,
    Rsa,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Ec => "ec",
            KeyType::Rsa => "rsa",
        }
    }

    /// Checks that the number of bits makes sense for this key type.
    pub fn check_bits(self, bits: u32) -> CaResult<()> {
        let ok = match self {
            KeyType::Ec => matches!(bits, 224 | 256 | 384 | 521),
            KeyType::Rsa => bits >= 2048,
        };
        if ok {
            Ok(())
        }
        else {
            Err(Error::invalid_config(format!(
                "private key bits {} not supported for key type {}",
                bits, self
            )))
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> CaResult<Self> {
        match s {
            "ec" => Ok(KeyType::Ec),
            "rsa" => Ok(KeyType::Rsa),
            other => Err(Error::invalid_config(format!(
                "private key type must be either 'ec' or 'rsa', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ Validity ------------------------------------------------------

/// The validity period of a certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Validity { not_before, not_after }
    }

    /// A validity starting slightly before `now` and lasting for `ttl`.
    pub fn from_now(now: DateTime<Utc>, ttl: std::time::Duration) -> Self {
        Validity {
            not_before: now - to_chrono(CERT_BACKDATE),
            not_after: now + to_chrono(ttl),
        }
    }

    /// Returns the same validity with the end capped at `limit`.
    pub fn capped_at(self, limit: DateTime<Utc>) -> Self {
        Validity {
            not_before: self.not_before,
            not_after: self.not_after.min(limit),
        }
    }
}


//------------ Keys ----------------------------------------------------------

/// Generates a new private key.
pub fn generate_private_key(
    key_type: KeyType,
    bits: u32,
) -> CaResult<PKey<Private>> {
    key_type.check_bits(bits)?;
    match key_type {
        KeyType::Ec => {
            let nid = match bits {
                224 => Nid::SECP224R1,
                256 => Nid::X9_62_PRIME256V1,
                384 => Nid::SECP384R1,
                _ => Nid::SECP521R1,
            };
            let group = EcGroup::from_curve_name(nid)?;
            let key = EcKey::generate(&group)?;
            Ok(PKey::from_ec_key(key)?)
        }
        KeyType::Rsa => Ok(PKey::from_rsa(Rsa::generate(bits)?)?),
    }
}

pub fn private_key_to_pem(key: &PKeyRef<Private>) -> CaResult<String> {
    pem_string(key.private_key_to_pem_pkcs8()?)
}

pub fn parse_private_key(pem: &str) -> CaResult<PKey<Private>> {
    PKey::private_key_from_pem(pem.as_bytes()).map_err(|e| {
        Error::invalid_config(format!("cannot parse private key: {}", e))
    })
}

/// Returns the key type and size of the public key in a certificate.
pub fn key_type_and_bits(cert: &X509Ref) -> CaResult<(String, u32)> {
    let key = cert.public_key()?;
    let key_type = match key.id() {
        Id::EC => KeyType::Ec,
        Id::RSA => KeyType::Rsa,
        other => {
            return Err(Error::invalid_cert(format!(
                "unsupported public key type {:?}",
                other
            )))
        }
    };
    Ok((key_type.to_string(), key.bits()))
}

/// Returns whether the certificate holds the public half of `key`.
pub fn cert_matches_key(
    cert: &X509Ref,
    key: &PKeyRef<Private>,
) -> CaResult<bool> {
    Ok(cert.public_key()?.public_eq(key))
}


//------------ Parsing and Encoding ------------------------------------------

pub fn parse_cert(pem: &str) -> CaResult<X509> {
    X509::from_pem(pem.as_bytes()).map_err(Error::invalid_cert)
}

/// Parses all certificates in a PEM bundle, leaf first.
pub fn parse_chain(pem: &str) -> CaResult<Vec<X509>> {
    let chain = X509::stack_from_pem(pem.as_bytes())
        .map_err(Error::invalid_cert)?;
    if chain.is_empty() {
        Err(Error::invalid_cert("no certificate found in PEM"))
    }
    else {
        Ok(chain)
    }
}

pub fn parse_csr(pem: &str) -> CaResult<X509Req> {
    X509Req::from_pem(pem.as_bytes()).map_err(Error::invalid_csr)
}

/// Parses a CSR and checks that it is signed by its own key.
pub fn parse_verified_csr(pem: &str) -> CaResult<X509Req> {
    let csr = parse_csr(pem)?;
    let key = csr.public_key().map_err(Error::invalid_csr)?;
    if csr.verify(&key).map_err(Error::invalid_csr)? {
        Ok(csr)
    }
    else {
        Err(Error::invalid_csr("signature does not verify"))
    }
}

pub fn cert_to_pem(cert: &X509Ref) -> CaResult<String> {
    pem_string(cert.to_pem()?)
}

pub fn csr_to_pem(csr: &X509ReqRef) -> CaResult<String> {
    pem_string(csr.to_pem()?)
}

/// Returns the PEM with exactly one trailing newline.
pub fn ensure_trailing_newline(pem: &str) -> String {
    let mut res = pem.trim_end().to_string();
    res.push('\n');
    res
}

fn pem_string(bytes: Vec<u8>) -> CaResult<String> {
    String::from_utf8(bytes).map_err(Error::invalid_cert)
}

/// Returns the URI subject alternative names requested in a CSR.
pub fn csr_uris(csr: &X509ReqRef) -> CaResult<Vec<String>> {
    let der = csr.to_der()?;
    let (_, parsed) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::invalid_csr(format!("cannot parse CSR: {}", e)))?;

    let mut uris = vec![];
    if let Some(extensions) = parsed.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    if let GeneralName::URI(uri) = name {
                        uris.push(uri.to_string());
                    }
                }
            }
        }
    }
    Ok(uris)
}

/// Returns the URI subject alternative names of a certificate.
pub fn cert_uris(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names.iter().filter_map(|n| n.uri().map(str::to_string)).collect()
        })
        .unwrap_or_default()
}


//------------ Inspection ----------------------------------------------------

pub fn common_name(cert: &X509Ref) -> Option<String> {
    name_cn(cert.subject_name())
}

fn name_cn(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

/// Returns the serial number as colon separated lower case hex.
pub fn serial_hex(cert: &X509Ref) -> CaResult<String> {
    Ok(colon_hex(&cert.serial_number().to_bn()?.to_vec()))
}

/// Returns the subject key identifier as colon separated hex.
///
/// Falls back to a hash of the public key for certificates without the
/// extension.
pub fn key_id(cert: &X509Ref) -> CaResult<String> {
    match cert.subject_key_id() {
        Some(skid) => Ok(colon_hex(skid.as_slice())),
        None => public_key_id(cert),
    }
}

/// Returns an identifier derived from the public key of a certificate.
///
/// This is the SHA-1 of the DER encoded subject public key info.
pub fn public_key_id(cert: &X509Ref) -> CaResult<String> {
    let der = cert.public_key()?.public_key_to_der()?;
    let digest = hash(MessageDigest::sha1(), &der)?;
    Ok(colon_hex(&digest))
}

pub fn not_before(cert: &X509Ref) -> CaResult<DateTime<Utc>> {
    from_asn1_time(cert.not_before())
}

pub fn not_after(cert: &X509Ref) -> CaResult<DateTime<Utc>> {
    from_asn1_time(cert.not_after())
}

pub fn colon_hex(bytes: &[u8]) -> String {
    bytes.iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

fn from_asn1_time(time: &Asn1TimeRef) -> CaResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        Error::invalid_cert(format!("time out of range: {}", time))
    })
}

fn to_asn1_time(time: DateTime<Utc>) -> CaResult<Asn1Time> {
    Ok(Asn1Time::from_unix(time.timestamp())?)
}


//------------ Creation ------------------------------------------------------

/// Creates a self-signed root certificate.
///
/// The root carries the signing SPIFFE id of the trust domain as its only
/// URI SAN.
pub fn create_root(
    key: &PKeyRef<Private>,
    common_name: &str,
    signing_uri: &str,
    validity: Validity,
) -> CaResult<X509> {
    let name = build_name(common_name)?;
    let mut builder = base_builder(&name, &name, key, validity)?;

    builder.append_extension(
        BasicConstraints::new().critical().ca().build()?
    )?;
    builder.append_extension(ca_key_usage()?)?;
    let skid = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(skid)?;
    let san = SubjectAlternativeName::new()
        .uri(signing_uri)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Creates a CSR for an intermediate CA with the given key.
pub fn create_ca_csr(
    key: &PKeyRef<Private>,
    common_name: &str,
    signing_uri: &str,
) -> CaResult<X509Req> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    let name = build_name(common_name)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    let mut extensions = Stack::new()?;
    extensions.push(BasicConstraints::new().critical().ca().build()?)?;
    extensions.push(
        SubjectAlternativeName::new()
            .uri(signing_uri)
            .build(&builder.x509v3_context(None))?
    )?;
    builder.add_extensions(&extensions)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Creates a CSR for a leaf certificate with the given URI SAN.
pub fn create_leaf_csr(
    key: &PKeyRef<Private>,
    common_name: &str,
    uri: &str,
) -> CaResult<X509Req> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    let name = build_name(common_name)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    let mut extensions = Stack::new()?;
    extensions.push(
        SubjectAlternativeName::new()
            .uri(uri)
            .build(&builder.x509v3_context(None))?
    )?;
    builder.add_extensions(&extensions)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Signs a CSR as an intermediate CA that may only issue leaves.
pub fn sign_ca_csr(
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    csr: &X509ReqRef,
    validity: Validity,
) -> CaResult<X509> {
    let pubkey = csr.public_key()?;
    let mut builder = base_builder(
        csr.subject_name(), issuer.subject_name(), &pubkey, validity
    )?;

    builder.append_extension(
        BasicConstraints::new().critical().ca().pathlen(0).build()?
    )?;
    builder.append_extension(ca_key_usage()?)?;
    append_key_ids(&mut builder, issuer)?;
    append_uris(&mut builder, issuer, &csr_uris(csr)?)?;

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Signs a leaf certificate for the identities requested in the CSR.
pub fn sign_leaf_csr(
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    csr: &X509ReqRef,
    validity: Validity,
) -> CaResult<X509> {
    let pubkey = csr.public_key()?;
    let mut builder = base_builder(
        csr.subject_name(), issuer.subject_name(), &pubkey, validity
    )?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?
    )?;
    builder.append_extension(
        ExtendedKeyUsage::new().server_auth().client_auth().build()?
    )?;
    append_key_ids(&mut builder, issuer)?;
    append_uris(&mut builder, issuer, &csr_uris(csr)?)?;

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Issues a certificate for the subject and key of another CA.
///
/// The result has the subject, public key and subject key identifier of
/// `other` but is signed by `issuer`. Anything signed by `other` can then
/// chain up to `issuer`. The validity never exceeds that of either CA.
pub fn cross_sign(
    other: &X509Ref,
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    now: DateTime<Utc>,
) -> CaResult<X509> {
    let not_after = not_after(other)?.min(not_after(issuer)?);
    let validity = Validity::new(now - to_chrono(CERT_BACKDATE), not_after);
    let pubkey = other.public_key()?;
    let mut builder = base_builder(
        other.subject_name(), issuer.subject_name(), &pubkey, validity
    )?;

    builder.append_extension(
        BasicConstraints::new().critical().ca().build()?
    )?;
    builder.append_extension(ca_key_usage()?)?;
    append_key_ids(&mut builder, issuer)?;
    append_uris(&mut builder, issuer, &cert_uris(other))?;

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn build_name(common_name: &str) -> CaResult<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn base_builder<T: HasPublic>(
    subject: &X509NameRef,
    issuer: &X509NameRef,
    pubkey: &PKeyRef<T>,
    validity: Validity,
) -> CaResult<X509Builder> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    builder.set_pubkey(pubkey)?;
    let not_before = to_asn1_time(validity.not_before)?;
    builder.set_not_before(&not_before)?;
    let not_after = to_asn1_time(validity.not_after)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

fn ca_key_usage() -> CaResult<openssl::x509::X509Extension> {
    Ok(KeyUsage::new()
        .critical()
        .digital_signature()
        .key_cert_sign()
        .crl_sign()
        .build()?)
}

fn append_key_ids(builder: &mut X509Builder, issuer: &X509Ref) -> CaResult<()> {
    let skid = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(Some(issuer), None))?;
    builder.append_extension(skid)?;
    let akid = AuthorityKeyIdentifier::new()
        .keyid(true)
        .build(&builder.x509v3_context(Some(issuer), None))?;
    builder.append_extension(akid)?;
    Ok(())
}

fn append_uris(
    builder: &mut X509Builder,
    issuer: &X509Ref,
    uris: &[String],
) -> CaResult<()> {
    if uris.is_empty() {
        return Ok(())
    }
    let mut san = SubjectAlternativeName::new();
    for uri in uris {
        san.uri(uri);
    }
    let san = san.build(&builder.x509v3_context(Some(issuer), None))?;
    builder.append_extension(san)?;
    Ok(())
}


//------------ Verification --------------------------------------------------

/// Verifies a leaf certificate chain against a root.
///
/// The `chain_pem` holds the leaf first, optionally followed by
/// intermediates. The `extra` intermediates are added to the untrusted set,
/// which is how a leaf issued under a rotated root is checked against the
/// new root and its bridge certificate.
pub fn verify_chain(
    root_pem: &str,
    extra: &[String],
    chain_pem: &str,
) -> CaResult<bool> {
    let root = parse_cert(root_pem)?;
    let mut certs = parse_chain(chain_pem)?.into_iter();
    let leaf = certs.next()
        .ok_or_else(|| Error::invalid_cert("empty certificate chain"))?;

    let mut store = X509StoreBuilder::new()?;
    store.add_cert(root)?;
    let store = store.build();

    let mut untrusted = Stack::new()?;
    for cert in certs {
        untrusted.push(cert)?;
    }
    for pem in extra {
        for cert in parse_chain(pem)? {
            untrusted.push(cert)?;
        }
    }

    let mut ctx = X509StoreContext::new()?;
    Ok(ctx.init(&store, &leaf, &untrusted, |c| c.verify_cert())?)
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use super::*;

    const TD_URI: &str = "spiffe://11111111-2222-3333-4444-555555555555.mesh";

    fn root(validity: Validity) -> (X509, PKey<Private>) {
        let key = generate_private_key(KeyType::Ec, 256).unwrap();
        let cert = create_root(&key, "test-root", TD_URI, validity).unwrap();
        (cert, key)
    }

    fn year() -> Validity {
        let now = Utc::now();
        Validity::new(now - Duration::minutes(1), now + Duration::days(365))
    }

    #[test]
    fn key_types() {
        assert_eq!(KeyType::from_str("ec").unwrap(), KeyType::Ec);
        assert!(KeyType::from_str("dsa").is_err());
        assert!(KeyType::Ec.check_bits(384).is_ok());
        assert!(KeyType::Ec.check_bits(2048).is_err());
        assert!(KeyType::Rsa.check_bits(1024).is_err());
    }

    #[test]
    fn root_inspection() {
        let validity = year();
        let (cert, key) = root(validity);

        assert_eq!(common_name(&cert).as_deref(), Some("test-root"));
        assert_eq!(cert_uris(&cert), vec![TD_URI.to_string()]);
        assert_eq!(key_type_and_bits(&cert).unwrap(), ("ec".to_string(), 256));
        assert!(cert_matches_key(&cert, &key).unwrap());
        assert_eq!(not_after(&cert).unwrap().timestamp(), validity.not_after.timestamp());

        let kid = key_id(&cert).unwrap();
        assert_eq!(kid.split(':').count(), 20);
    }

    #[test]
    fn leaf_chain_verifies() {
        let (root_cert, root_key) = root(year());

        let int_key = generate_private_key(KeyType::Ec, 256).unwrap();
        let int_csr = create_ca_csr(&int_key, "test-int", TD_URI).unwrap();
        let int = sign_ca_csr(&root_cert, &root_key, &int_csr, year()).unwrap();

        let leaf_uri = format!("{}/ns/default/dc/dc1/svc/web", TD_URI);
        let leaf_key = generate_private_key(KeyType::Ec, 256).unwrap();
        let leaf_csr = create_leaf_csr(&leaf_key, "web", &leaf_uri).unwrap();
        assert_eq!(csr_uris(&leaf_csr).unwrap(), vec![leaf_uri.clone()]);

        let leaf = sign_leaf_csr(&int, &int_key, &leaf_csr, year()).unwrap();
        assert_eq!(cert_uris(&leaf), vec![leaf_uri]);

        let chain = format!(
            "{}{}",
            cert_to_pem(&leaf).unwrap(),
            cert_to_pem(&int).unwrap()
        );
        let root_pem = cert_to_pem(&root_cert).unwrap();
        assert!(verify_chain(&root_pem, &[], &chain).unwrap());

        let (other_root, _) = root(year());
        let other_pem = cert_to_pem(&other_root).unwrap();
        assert!(!verify_chain(&other_pem, &[], &chain).unwrap());
    }

    #[test]
    fn cross_signed_root_bridges_chains() {
        let (old_root, old_key) = root(year());
        let (new_root, new_key) = root(year());

        let leaf_key = generate_private_key(KeyType::Ec, 256).unwrap();
        let leaf_csr = create_leaf_csr(&leaf_key, "db", TD_URI).unwrap();
        let leaf = sign_leaf_csr(&old_root, &old_key, &leaf_csr, year()).unwrap();
        let leaf_pem = cert_to_pem(&leaf).unwrap();

        let bridge = cross_sign(&old_root, &new_root, &new_key, Utc::now()).unwrap();
        assert_eq!(key_id(&bridge).unwrap(), key_id(&old_root).unwrap());

        let new_pem = cert_to_pem(&new_root).unwrap();
        assert!(!verify_chain(&new_pem, &[], &leaf_pem).unwrap());
        assert!(verify_chain(&new_pem, &[cert_to_pem(&bridge).unwrap()], &leaf_pem).unwrap());
    }

    #[test]
    fn csr_signature_is_checked() {
        let key = generate_private_key(KeyType::Ec, 256).unwrap();
        let csr = create_leaf_csr(&key, "web", TD_URI).unwrap();
        let pem = csr_to_pem(&csr).unwrap();
        assert!(parse_verified_csr(&pem).is_ok());
        assert!(parse_verified_csr("not a csr").is_err());
    }
}
