use md5::{Digest, Md5};
use russh::keys::{ssh_key, PublicKey};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha256;

/// Largest RSA modulus accepted from a client key.
const MAX_RSA_MODULUS_BITS: usize = 16384;

/// SSH wire encoding of a public key.
pub fn key_blob(key: &PublicKey) -> Result<Vec<u8>, ssh_key::Error> {
    key.to_bytes()
}

/// Legacy OpenSSH fingerprint: MD5 of the key blob as colon-separated hex pairs.
pub fn md5_fingerprint(key: &PublicKey) -> Result<String, ssh_key::Error> {
    let digest = Md5::digest(key_blob(key)?);
    Ok(digest
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":"))
}

/// RSA public key carried by `key`. `None` for other key types or a malformed modulus.
pub fn rsa_public_key(key: &PublicKey) -> Option<RsaPublicKey> {
    let rsa = key.key_data().rsa()?;
    let n = BigUint::from_bytes_be(rsa.n.as_positive_bytes()?);
    let e = BigUint::from_bytes_be(rsa.e.as_positive_bytes()?);
    RsaPublicKey::new_with_max_size(n, e, MAX_RSA_MODULUS_BITS).ok()
}

/// RSASSA-PKCS1-v1_5 verification of a SHA-256 digest.
pub fn verify_sha256_signature(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> bool {
    key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .is_ok()
}
