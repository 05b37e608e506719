//! Diffie-Hellman session key agreement.
//!
//! Uses the 1024-bit MODP group from RFC 2409 (Oakley group 2) with
//! generator 2. Key pairs are generated on demand by the session layer.
//! The session key is the leading bytes of the shared secret, written at
//! the full width of the prime.

use num_bigint::BigUint;
use rand::RngCore;
use zeroize::Zeroizing;

use super::CryptoError;

const OAKLEY_GROUP_2_PRIME: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

/// Smallest prime accepted from a peer, bits.
pub const MIN_DH_PRIME_BITS: u64 = 512;
/// Largest prime accepted from a peer, bits.
pub const MAX_DH_PRIME_BITS: u64 = 4096;

/// Group parameters `(p, g)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    /// Prime modulus.
    pub p: BigUint,
    /// Generator.
    pub g: BigUint,
}

impl DhParams {
    /// The default 1024-bit group.
    pub fn oakley_group_2() -> Self {
        Self {
            p: BigUint::parse_bytes(OAKLEY_GROUP_2_PRIME.as_bytes(), 16)
                .unwrap_or_default(),
            g: BigUint::from(2u32),
        }
    }

    /// Builds parameters received from a peer.
    pub fn from_bytes(p: &[u8], g: &[u8]) -> Result<Self, CryptoError> {
        // Checked before any arithmetic on the values.
        if p.len() as u64 * 8 > MAX_DH_PRIME_BITS + 8 || g.len() > p.len() {
            return Err(CryptoError::InvalidKey("DH parameters too large".into()));
        }
        let params = Self {
            p: BigUint::from_bytes_be(p),
            g: BigUint::from_bytes_be(g),
        };
        let bits = params.p.bits();
        if !(MIN_DH_PRIME_BITS..=MAX_DH_PRIME_BITS).contains(&bits)
            || params.g < BigUint::from(2u32)
            || params.g >= params.p
        {
            return Err(CryptoError::InvalidKey("unacceptable DH parameters".into()));
        }
        Ok(params)
    }

    /// Prime, big-endian.
    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    /// Generator, big-endian.
    pub fn g_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }
}

impl Default for DhParams {
    fn default() -> Self {
        Self::oakley_group_2()
    }
}

/// An ephemeral key pair.
pub struct DhKeyPair {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Generates a key pair in the given group.
    pub fn generate(params: DhParams) -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(bytes.as_mut());
        let private = BigUint::from_bytes_be(bytes.as_ref()) + 2u32;
        let public = params.g.modpow(&private, &params.p);
        Self {
            params,
            private,
            public,
        }
    }

    /// The group parameters.
    pub fn params(&self) -> &DhParams {
        &self.params
    }

    /// Public value `g^x mod p`, big-endian.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Computes the shared secret with a peer public value.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        let upper = &self.params.p - &one;
        if peer <= one || peer >= upper {
            return Err(CryptoError::InvalidKey("DH public value out of range".into()));
        }
        Ok(Zeroizing::new(
            peer.modpow(&self.private, &self.params.p).to_bytes_be(),
        ))
    }

    /// Derives a session key of `key_len` bytes from the shared secret.
    pub fn session_key(
        &self,
        peer_public: &[u8],
        key_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let secret = self.shared_secret(peer_public)?;
        let width = ((self.params.p.bits() + 7) / 8) as usize;
        if key_len > width {
            return Err(CryptoError::InvalidKey(format!(
                "{key_len}-byte key from a {width}-byte group"
            )));
        }
        let mut padded = Zeroizing::new(vec![0u8; width]);
        padded[width - secret.len()..].copy_from_slice(&secret);
        Ok(Zeroizing::new(padded[..key_len].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_prime_is_1024_bits() {
        assert_eq!(DhParams::oakley_group_2().p.bits(), 1024);
    }

    #[test]
    fn test_both_sides_agree() {
        let alice = DhKeyPair::generate(DhParams::default());
        let bob = DhKeyPair::generate(alice.params().clone());
        let a = alice.session_key(&bob.public_bytes(), 16).unwrap();
        let b = bob.session_key(&alice.public_bytes(), 16).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert_eq!(a.len(), 16);

        let secret = alice.shared_secret(&bob.public_bytes()).unwrap();
        let full = alice.session_key(&bob.public_bytes(), 128).unwrap();
        assert!(full.ends_with(&secret));
        assert!(alice.session_key(&bob.public_bytes(), 129).is_err());
    }

    #[test]
    fn test_rejects_degenerate_public_value() {
        let pair = DhKeyPair::generate(DhParams::default());
        assert!(pair.shared_secret(&[1]).is_err());
        assert!(pair.shared_secret(&[0]).is_err());
    }

    #[test]
    fn test_rejects_weak_params() {
        assert!(DhParams::from_bytes(&[0xff; 8], &[2]).is_err());
        let oversized = vec![0xff; (MAX_DH_PRIME_BITS / 8) as usize + 64];
        assert!(DhParams::from_bytes(&oversized, &[2]).is_err());
        let largest = vec![0xff; (MAX_DH_PRIME_BITS / 8) as usize];
        assert!(DhParams::from_bytes(&largest, &[2]).is_ok());
        let p = DhParams::oakley_group_2().p.to_bytes_be();
        assert!(DhParams::from_bytes(&p, &[2]).is_ok());
    }
}
