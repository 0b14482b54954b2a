//! SRP-6a over the RFC 5054 2048-bit group with SHA-256.
//!
//! The verifier is derived from the lower-cased user name; the proof hashes
//! the name as sent. Numbers are exchanged big-endian without padding, and
//! only `k` and `u` hash padded values.

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const N_HEX: &[u8] = b"\
AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050\
A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50\
E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8\
55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B\
CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748\
544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6\
AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6\
94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";

/// Byte length of the group modulus.
const N_LEN: usize = 256;
const SALT_LEN: usize = 16;
const SECRET_LEN: usize = 32;

static N: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(N_HEX, 16).unwrap_or_else(|| unreachable!("constant modulus parses"))
});
static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
static K: Lazy<BigUint> = Lazy::new(|| hash_to_int(&[&N.to_bytes_be(), &pad(&G)]));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SrpError {
    #[error("public value is zero modulo N")]
    IllegalParameter,
    #[error("proof does not match")]
    BadProof,
}

fn pad(x: &BigUint) -> Vec<u8> {
    let bytes = x.to_bytes_be();
    let mut padded = vec![0; N_LEN.saturating_sub(bytes.len())];
    padded.extend_from_slice(&bytes);
    padded
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_to_int(parts: &[&[u8]]) -> BigUint {
    BigUint::from_bytes_be(&hash(parts))
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn private_key(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let inner = hash(&[username.to_lowercase().as_bytes(), b":", password.as_bytes()]);
    hash_to_int(&[salt, &inner])
}

fn scrambler(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    hash_to_int(&[&pad(a_pub), &pad(b_pub)])
}

fn proof(username: &str, salt: &[u8], a_pub: &BigUint, b_pub: &BigUint, key: &[u8; 32]) -> [u8; 32] {
    let h_n = hash(&[&N.to_bytes_be()]);
    let h_g = hash(&[&G.to_bytes_be()]);
    let mut h_xor = [0u8; 32];
    for (i, byte) in h_xor.iter_mut().enumerate() {
        *byte = h_n[i] ^ h_g[i];
    }
    let h_i = hash(&[username.as_bytes()]);
    hash(&[
        &h_xor,
        &h_i,
        salt,
        &a_pub.to_bytes_be(),
        &b_pub.to_bytes_be(),
        key,
    ])
}

/// Creates a fresh salt and verifier for enrollment.
pub fn create_verifier(username: &str, password: &str) -> (Vec<u8>, Vec<u8>) {
    let salt = random_bytes(SALT_LEN);
    let verifier = compute_verifier(username, password, &salt);
    (salt, verifier)
}

pub fn compute_verifier(username: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let x = private_key(username, password, salt);
    G.modpow(&x, &N).to_bytes_be()
}

/// The proving side of one exchange.
pub struct ClientHandshake {
    username: String,
    password: String,
    a: BigUint,
    a_pub: BigUint,
}

impl ClientHandshake {
    pub fn new(username: &str, password: &str) -> Self {
        let a = BigUint::from_bytes_be(&random_bytes(SECRET_LEN));
        let a_pub = G.modpow(&a, &N);
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            a,
            a_pub,
        }
    }

    /// `A`, sent in `SrpBytesA`.
    pub fn a_pub(&self) -> Vec<u8> {
        self.a_pub.to_bytes_be()
    }

    /// Answers the server's challenge with the proof `M`.
    pub fn respond(&self, salt: &[u8], b_pub: &[u8]) -> Result<Vec<u8>, SrpError> {
        let b_pub = BigUint::from_bytes_be(b_pub);
        if (&b_pub % &*N) == BigUint::default() {
            return Err(SrpError::IllegalParameter);
        }
        let u = scrambler(&self.a_pub, &b_pub);
        if u == BigUint::default() {
            return Err(SrpError::IllegalParameter);
        }

        let x = private_key(&self.username, &self.password, salt);
        let kgx = (&*K * G.modpow(&x, &N)) % &*N;
        let base = ((&b_pub % &*N) + &*N - kgx) % &*N;
        let exponent = &self.a + &u * &x;
        let secret = base.modpow(&exponent, &N);
        let key = hash(&[&secret.to_bytes_be()]);

        Ok(proof(&self.username, salt, &self.a_pub, &b_pub, &key).to_vec())
    }
}

/// The verifying side of one exchange.
pub struct ServerHandshake {
    b_pub: BigUint,
    expected: [u8; 32],
}

impl ServerHandshake {
    pub fn new(
        username: &str,
        salt: &[u8],
        verifier: &[u8],
        a_pub: &[u8],
    ) -> Result<Self, SrpError> {
        let a_pub = BigUint::from_bytes_be(a_pub);
        if (&a_pub % &*N) == BigUint::default() {
            return Err(SrpError::IllegalParameter);
        }
        let v = BigUint::from_bytes_be(verifier);

        let b = BigUint::from_bytes_be(&random_bytes(SECRET_LEN));
        let b_pub = ((&*K * &v) + G.modpow(&b, &N)) % &*N;
        let u = scrambler(&a_pub, &b_pub);
        if u == BigUint::default() {
            return Err(SrpError::IllegalParameter);
        }

        let secret = ((&a_pub * v.modpow(&u, &N)) % &*N).modpow(&b, &N);
        let key = hash(&[&secret.to_bytes_be()]);
        let expected = proof(username, salt, &a_pub, &b_pub, &key);
        Ok(Self { b_pub, expected })
    }

    /// `B`, sent in `SrpBytesSaltB`.
    pub fn b_pub(&self) -> Vec<u8> {
        self.b_pub.to_bytes_be()
    }

    /// Checks the client's proof in constant time.
    pub fn verify(&self, m: &[u8]) -> Result<(), SrpError> {
        if bool::from(self.expected.as_slice().ct_eq(m)) {
            Ok(())
        } else {
            Err(SrpError::BadProof)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(enrolled: &str, login: &str, password: &str, attempt: &str) -> Result<(), SrpError> {
        let (salt, verifier) = create_verifier(enrolled, password);
        let client = ClientHandshake::new(login, attempt);
        let server = ServerHandshake::new(login, &salt, &verifier, &client.a_pub())?;
        let m = client.respond(&salt, &server.b_pub())?;
        server.verify(&m)
    }

    #[test]
    fn right_password_is_accepted() {
        assert_eq!(exchange("alice", "alice", "hunter2", "hunter2"), Ok(()));
    }

    #[test]
    fn empty_password_works() {
        assert_eq!(exchange("bob", "bob", "", ""), Ok(()));
    }

    #[test]
    fn verifier_ignores_name_case() {
        assert_eq!(exchange("Alice", "alice", "pw", "pw"), Ok(()));
    }

    #[test]
    fn wrong_password_is_rejected() {
        assert_eq!(
            exchange("alice", "alice", "hunter2", "hunter3"),
            Err(SrpError::BadProof)
        );
    }

    #[test]
    fn zero_public_value_is_illegal() {
        let (salt, verifier) = create_verifier("a", "b");
        assert!(matches!(
            ServerHandshake::new("a", &salt, &verifier, &N.to_bytes_be()),
            Err(SrpError::IllegalParameter)
        ));
    }
}
