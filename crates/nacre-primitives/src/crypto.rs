//! Pure cryptography for the chain-state engine.
//!
//! Hashing uses BLAKE2b. Group arithmetic runs over the Ristretto group;
//! keys, key images and signature halves travel as opaque 32-byte strings
//! and are only interpreted here.

use crate::types::{Hash, KeyImage, KeyPair, PublicKey, SecretKey, Signature};
use blake2::digest::consts::{U32, U64};
use blake2::{Blake2b, Digest};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};

type Blake2b256 = Blake2b<U32>;
type Blake2b512 = Blake2b<U64>;

/// Domain tag for the proof-of-work hash.
const POW_TAG: &[u8] = b"nacre/pow/v1";
/// Domain tag for the lightweight proof-of-work variant.
const POW_LITE_TAG: &[u8] = b"nacre/pow/lite/v1";
/// Iterations of the baseline proof-of-work hash.
const POW_ROUNDS: usize = 8;
/// Iterations of the lite proof-of-work hash.
const POW_LITE_ROUNDS: usize = 2;

/// Why a ring signature failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingCheckError {
    /// A ring member key does not decode to a group element. The ring data
    /// itself is damaged, which on the validation path means database
    /// corruption rather than a malicious signature.
    CorruptedKey,
    /// The signature does not verify.
    BadSignature,
}

/// Fast 256-bit hash over arbitrary bytes.
pub fn fast_hash(data: &[u8]) -> Hash {
    let digest = Blake2b256::digest(data);
    Hash(digest.into())
}

fn wide_hash(data: &[u8]) -> [u8; 64] {
    Blake2b512::digest(data).into()
}

fn hash_to_scalar(data: &[u8]) -> Scalar {
    Scalar::from_bytes_mod_order_wide(&wide_hash(data))
}

fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    RistrettoPoint::from_uniform_bytes(&wide_hash(data))
}

fn decompress(key: &PublicKey) -> Option<RistrettoPoint> {
    CompressedRistretto(key.0).decompress()
}

fn scalar_from_secret(secret: &SecretKey) -> Option<Scalar> {
    Scalar::from_canonical_bytes(secret.0).into()
}

/// Whether 32 bytes decode to a valid group element.
pub fn key_is_valid(key: &PublicKey) -> bool {
    decompress(key).is_some()
}

/// Public key for a secret scalar; `None` if the scalar is not canonical.
pub fn secret_to_public(secret: &SecretKey) -> Option<PublicKey> {
    let scalar = scalar_from_secret(secret)?;
    Some(PublicKey(RistrettoPoint::mul_base(&scalar).compress().0))
}

/// Fresh random key pair.
pub fn random_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> KeyPair {
    let scalar = Scalar::random(rng);
    KeyPair {
        public_key: PublicKey(RistrettoPoint::mul_base(&scalar).compress().0),
        secret_key: SecretKey(scalar.to_bytes()),
    }
}

/// Deterministic key pair from a seed. Used for the genesis coinbase, which
/// must be identical on every node.
pub fn keypair_from_seed(seed: &[u8]) -> KeyPair {
    let scalar = hash_to_scalar(seed);
    KeyPair {
        public_key: PublicKey(RistrettoPoint::mul_base(&scalar).compress().0),
        secret_key: SecretKey(scalar.to_bytes()),
    }
}

/// Shared-secret derivation between a transaction key and a view key.
pub fn generate_key_derivation(key: &PublicKey, secret: &SecretKey) -> Option<PublicKey> {
    let point = decompress(key)?;
    let scalar = scalar_from_secret(secret)?;
    Some(PublicKey((scalar * point).compress().0))
}

fn derivation_to_scalar(derivation: &PublicKey, output_index: u64) -> Scalar {
    let mut data = Vec::with_capacity(32 + 10);
    data.extend_from_slice(&derivation.0);
    let mut value = output_index;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        data.push(byte);
        if value == 0 {
            break;
        }
    }
    hash_to_scalar(&data)
}

/// One-time output key for `spend_public_key` at `output_index`.
pub fn derive_public_key(
    derivation: &PublicKey,
    output_index: u64,
    spend_public_key: &PublicKey,
) -> Option<PublicKey> {
    let base = decompress(spend_public_key)?;
    let scalar = derivation_to_scalar(derivation, output_index);
    Some(PublicKey((RistrettoPoint::mul_base(&scalar) + base).compress().0))
}

/// Secret key matching [`derive_public_key`] for the owner of the spend key.
pub fn derive_secret_key(
    derivation: &PublicKey,
    output_index: u64,
    spend_secret_key: &SecretKey,
) -> Option<SecretKey> {
    let base = scalar_from_secret(spend_secret_key)?;
    let scalar = derivation_to_scalar(derivation, output_index);
    Some(SecretKey((scalar + base).to_bytes()))
}

/// Key image of the output key pair `(public, secret)`.
pub fn generate_key_image(public: &PublicKey, secret: &SecretKey) -> Option<KeyImage> {
    let scalar = scalar_from_secret(secret)?;
    let base = hash_to_point(&public.0);
    Some(KeyImage((scalar * base).compress().0))
}

fn ring_challenge(prefix_hash: &Hash, commitments: &[(RistrettoPoint, RistrettoPoint)]) -> Scalar {
    let mut data = Vec::with_capacity(32 + commitments.len() * 64);
    data.extend_from_slice(&prefix_hash.0);
    for (l, r) in commitments {
        data.extend_from_slice(&l.compress().0);
        data.extend_from_slice(&r.compress().0);
    }
    hash_to_scalar(&data)
}

/// Produce a ring signature over `prefix_hash` with the ring `public_keys`,
/// signing with `secret` which must match `public_keys[secret_index]`.
pub fn generate_ring_signature<R: RngCore + CryptoRng>(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    public_keys: &[PublicKey],
    secret: &SecretKey,
    secret_index: usize,
    rng: &mut R,
) -> Option<Vec<Signature>> {
    if secret_index >= public_keys.len() {
        return None;
    }
    let secret_scalar = scalar_from_secret(secret)?;
    let image_point = CompressedRistretto(key_image.0).decompress()?;

    let mut signatures = vec![([Scalar::ZERO, Scalar::ZERO]); public_keys.len()];
    let mut commitments = Vec::with_capacity(public_keys.len());
    let mut challenge_sum = Scalar::ZERO;
    let mut nonce = Scalar::ZERO;

    for (i, public_key) in public_keys.iter().enumerate() {
        if i == secret_index {
            nonce = Scalar::random(rng);
            let l = RistrettoPoint::mul_base(&nonce);
            let r = nonce * hash_to_point(&public_key.0);
            commitments.push((l, r));
        } else {
            let challenge = Scalar::random(rng);
            let response = Scalar::random(rng);
            let point = decompress(public_key)?;
            let l = RistrettoPoint::mul_base(&response) + challenge * point;
            let r = response * hash_to_point(&public_key.0) + challenge * image_point;
            commitments.push((l, r));
            signatures[i] = [challenge, response];
            challenge_sum += challenge;
        }
    }

    let challenge = ring_challenge(prefix_hash, &commitments);
    let own_challenge = challenge - challenge_sum;
    let own_response = nonce - own_challenge * secret_scalar;
    signatures[secret_index] = [own_challenge, own_response];

    Some(
        signatures
            .into_iter()
            .map(|[challenge, response]| {
                let mut bytes = [0u8; 64];
                bytes[..32].copy_from_slice(&challenge.to_bytes());
                bytes[32..].copy_from_slice(&response.to_bytes());
                Signature(bytes)
            })
            .collect(),
    )
}

/// Verify a ring signature. The ring is the `public_keys` slice in the
/// order the signer fixed it; `signatures` holds one element per member.
pub fn check_ring_signature(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    public_keys: &[PublicKey],
    signatures: &[Signature],
) -> Result<(), RingCheckError> {
    if public_keys.is_empty() || signatures.len() != public_keys.len() {
        return Err(RingCheckError::BadSignature);
    }
    let image_point = CompressedRistretto(key_image.0)
        .decompress()
        .ok_or(RingCheckError::BadSignature)?;

    let mut commitments = Vec::with_capacity(public_keys.len());
    let mut challenge_sum = Scalar::ZERO;
    for (public_key, signature) in public_keys.iter().zip(signatures) {
        let challenge: Option<Scalar> =
            Scalar::from_canonical_bytes(signature.0[..32].try_into().unwrap()).into();
        let response: Option<Scalar> =
            Scalar::from_canonical_bytes(signature.0[32..].try_into().unwrap()).into();
        let (challenge, response) = match (challenge, response) {
            (Some(c), Some(r)) => (c, r),
            _ => return Err(RingCheckError::BadSignature),
        };
        let point = decompress(public_key).ok_or(RingCheckError::CorruptedKey)?;
        let l = RistrettoPoint::mul_base(&response) + challenge * point;
        let r = response * hash_to_point(&public_key.0) + challenge * image_point;
        commitments.push((l, r));
        challenge_sum += challenge;
    }

    if ring_challenge(prefix_hash, &commitments) == challenge_sum {
        Ok(())
    } else {
        Err(RingCheckError::BadSignature)
    }
}

/// Merkle tree hash over transaction hashes, coinbase first.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    assert!(!hashes.is_empty(), "tree_hash of empty list");
    match hashes.len() {
        1 => hashes[0],
        2 => hash_pair(&hashes[0], &hashes[1]),
        count => {
            // Width of the bottom row: highest power of two below count.
            let mut width = 1usize;
            while width << 1 < count {
                width <<= 1;
            }
            let mut row = Vec::with_capacity(width);
            let carried = 2 * width - count;
            row.extend_from_slice(&hashes[..carried]);
            let mut i = carried;
            while i < count {
                row.push(hash_pair(&hashes[i], &hashes[i + 1]));
                i += 2;
            }
            debug_assert_eq!(row.len(), width);
            while row.len() > 2 {
                let mut next = Vec::with_capacity(row.len() / 2);
                for pair in row.chunks_exact(2) {
                    next.push(hash_pair(&pair[0], &pair[1]));
                }
                row = next;
            }
            hash_pair(&row[0], &row[1])
        }
    }
}

/// Root of a merge-mining branch with `leaf` folded in from the bottom.
pub fn tree_hash_from_branch(branch: &[Hash], leaf: &Hash) -> Hash {
    let mut current = *leaf;
    for node in branch.iter().rev() {
        current = hash_pair(node, &current);
    }
    current
}

fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&a.0);
    data[32..].copy_from_slice(&b.0);
    fast_hash(&data)
}

fn iterated_hash(tag: &[u8], data: &[u8], rounds: usize) -> Hash {
    let mut buf = Vec::with_capacity(tag.len() + data.len());
    buf.extend_from_slice(tag);
    buf.extend_from_slice(data);
    let mut digest = fast_hash(&buf);
    for _ in 1..rounds {
        digest = fast_hash(&digest.0);
    }
    digest
}

/// Baseline proof-of-work hash.
pub fn slow_hash(data: &[u8]) -> Hash {
    iterated_hash(POW_TAG, data, POW_ROUNDS)
}

/// Lightweight proof-of-work hash used by the latest block version.
pub fn slow_hash_lite(data: &[u8]) -> Hash {
    iterated_hash(POW_LITE_TAG, data, POW_LITE_ROUNDS)
}

/// Whether `hash`, read as a little-endian 256-bit integer, satisfies
/// `hash * difficulty < 2^256`.
pub fn check_hash(hash: &Hash, difficulty: u64) -> bool {
    let mut carry = 0u64;
    for limb_bytes in hash.0.chunks_exact(8) {
        let limb = u64::from_le_bytes(limb_bytes.try_into().unwrap());
        let product = u128::from(limb) * u128::from(difficulty) + u128::from(carry);
        carry = (product >> 64) as u64;
    }
    carry == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0xbeef)
    }

    #[test]
    fn test_fast_hash_is_stable() {
        let a = fast_hash(b"nacre");
        let b = fast_hash(b"nacre");
        let c = fast_hash(b"narce");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_keypair_round_trip() {
        let mut rng = rng();
        let pair = random_keypair(&mut rng);
        assert!(key_is_valid(&pair.public_key));
        assert_eq!(secret_to_public(&pair.secret_key), Some(pair.public_key));
    }

    #[test]
    fn test_keypair_from_seed_deterministic() {
        let a = keypair_from_seed(b"seed");
        let b = keypair_from_seed(b"seed");
        assert_eq!(a.public_key, b.public_key);
        assert_ne!(a.public_key, keypair_from_seed(b"other").public_key);
    }

    #[test]
    fn test_derived_keys_match() {
        let mut rng = rng();
        let tx_key = random_keypair(&mut rng);
        let view = random_keypair(&mut rng);
        let spend = random_keypair(&mut rng);

        // Sender derives from the receiver's view key, receiver from the
        // transaction public key; both must land on the same output key.
        let sender_side = generate_key_derivation(&view.public_key, &tx_key.secret_key).unwrap();
        let receiver_side = generate_key_derivation(&tx_key.public_key, &view.secret_key).unwrap();
        assert_eq!(sender_side, receiver_side);

        let out_pub = derive_public_key(&sender_side, 3, &spend.public_key).unwrap();
        let out_sec = derive_secret_key(&receiver_side, 3, &spend.secret_key).unwrap();
        assert_eq!(secret_to_public(&out_sec), Some(out_pub));
    }

    #[test]
    fn test_ring_signature_round_trip() {
        let mut rng = rng();
        let owner = random_keypair(&mut rng);
        let decoy_a = random_keypair(&mut rng);
        let decoy_b = random_keypair(&mut rng);
        let ring = [decoy_a.public_key, owner.public_key, decoy_b.public_key];
        let image = generate_key_image(&owner.public_key, &owner.secret_key).unwrap();
        let prefix_hash = fast_hash(b"tx prefix");

        let signatures =
            generate_ring_signature(&prefix_hash, &image, &ring, &owner.secret_key, 1, &mut rng)
                .unwrap();
        assert_eq!(signatures.len(), 3);
        assert!(check_ring_signature(&prefix_hash, &image, &ring, &signatures).is_ok());
    }

    #[test]
    fn test_ring_signature_rejects_wrong_message() {
        let mut rng = rng();
        let owner = random_keypair(&mut rng);
        let ring = [owner.public_key];
        let image = generate_key_image(&owner.public_key, &owner.secret_key).unwrap();
        let prefix_hash = fast_hash(b"tx prefix");
        let signatures =
            generate_ring_signature(&prefix_hash, &image, &ring, &owner.secret_key, 0, &mut rng)
                .unwrap();

        let other_hash = fast_hash(b"another prefix");
        assert_eq!(
            check_ring_signature(&other_hash, &image, &ring, &signatures),
            Err(RingCheckError::BadSignature)
        );
    }

    #[test]
    fn test_ring_signature_rejects_wrong_image() {
        let mut rng = rng();
        let owner = random_keypair(&mut rng);
        let stranger = random_keypair(&mut rng);
        let ring = [owner.public_key];
        let image = generate_key_image(&owner.public_key, &owner.secret_key).unwrap();
        let wrong_image =
            generate_key_image(&stranger.public_key, &stranger.secret_key).unwrap();
        let prefix_hash = fast_hash(b"tx prefix");
        let signatures =
            generate_ring_signature(&prefix_hash, &image, &ring, &owner.secret_key, 0, &mut rng)
                .unwrap();
        assert_eq!(
            check_ring_signature(&prefix_hash, &wrong_image, &ring, &signatures),
            Err(RingCheckError::BadSignature)
        );
    }

    #[test]
    fn test_ring_signature_corrupted_member_key() {
        let mut rng = rng();
        let owner = random_keypair(&mut rng);
        let ring = [owner.public_key];
        let image = generate_key_image(&owner.public_key, &owner.secret_key).unwrap();
        let prefix_hash = fast_hash(b"tx prefix");
        let signatures =
            generate_ring_signature(&prefix_hash, &image, &ring, &owner.secret_key, 0, &mut rng)
                .unwrap();

        // Not every 32-byte string is a group element; all-0xff is not.
        let broken_ring = [PublicKey([0xff; 32])];
        assert_eq!(
            check_ring_signature(&prefix_hash, &image, &broken_ring, &signatures),
            Err(RingCheckError::CorruptedKey)
        );
    }

    #[test]
    fn test_tree_hash_sizes() {
        let hashes: Vec<Hash> = (0u8..7).map(|i| fast_hash(&[i])).collect();
        assert_eq!(tree_hash(&hashes[..1]), hashes[0]);
        let two = tree_hash(&hashes[..2]);
        assert_ne!(two, hashes[0]);
        // Sizes crossing the power-of-two boundaries must all be defined
        // and distinct from one another for distinct inputs.
        let roots: Vec<Hash> = (1..=7).map(|n| tree_hash(&hashes[..n])).collect();
        for window in roots.windows(2) {
            assert_ne!(window[0], window[1]);
        }
    }

    #[test]
    fn test_check_hash_difficulty_one_always_passes() {
        assert!(check_hash(&Hash([0xff; 32]), 1));
    }

    #[test]
    fn test_check_hash_bounds() {
        // 2^255 * 2 == 2^256: exactly at the limit, so it must fail.
        let mut high = [0u8; 32];
        high[31] = 0x80;
        assert!(!check_hash(&Hash(high), 2));
        // One below passes.
        let mut below = [0xffu8; 32];
        below[31] = 0x7f;
        assert!(check_hash(&Hash(below), 2));
        assert!(check_hash(&Hash::ZERO, u64::MAX));
    }
}
