use crate::signature::SECP;
use bitcoin::secp256k1::{self, PublicKey};
use sha2::{Digest, Sha256};

/// The four public basepoints a peer commits to at channel open; every
/// per-commitment key is derived from one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Basepoints {
    pub revocation: PublicKey,
    pub payment: PublicKey,
    pub htlc: PublicKey,
    pub delayed_payment: PublicKey,
}

/// The per-commitment keys a commitment transaction is built from.
#[derive(Clone, Copy, Debug)]
pub struct Keyset {
    pub self_revocation_key: PublicKey,
    pub self_payment_key: PublicKey,
    pub other_payment_key: PublicKey,
    pub self_htlc_key: PublicKey,
    pub other_htlc_key: PublicKey,
    pub self_delayed_payment_key: PublicKey,
}

#[derive(Debug, thiserror::Error)]
#[error("key derivation failed: {0}")]
pub struct KeyDerivationError(#[from] secp256k1::Error);

/// `basepoint + SHA256(per_commitment_point || basepoint) * G`.
pub fn derive_simple_key(
    basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, KeyDerivationError> {
    let tweak: [u8; 32] = Sha256::new()
        .chain(&per_commitment_point.serialize()[..])
        .chain(&basepoint.serialize()[..])
        .finalize()
        .into();

    let mut key = *basepoint;
    key.add_exp_assign(&*SECP, &tweak)?;
    Ok(key)
}

/// `revocation_basepoint * SHA256(revocation_basepoint ||
/// per_commitment_point) + per_commitment_point *
/// SHA256(per_commitment_point || revocation_basepoint)`.
pub fn derive_revocation_key(
    revocation_basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, KeyDerivationError> {
    let h1: [u8; 32] = Sha256::new()
        .chain(&revocation_basepoint.serialize()[..])
        .chain(&per_commitment_point.serialize()[..])
        .finalize()
        .into();
    let h2: [u8; 32] = Sha256::new()
        .chain(&per_commitment_point.serialize()[..])
        .chain(&revocation_basepoint.serialize()[..])
        .finalize()
        .into();

    let mut blinded_basepoint = *revocation_basepoint;
    blinded_basepoint.mul_assign(&*SECP, &h1)?;

    let mut blinded_commitment_point = *per_commitment_point;
    blinded_commitment_point.mul_assign(&*SECP, &h2)?;

    Ok(blinded_basepoint.combine(&blinded_commitment_point)?)
}

/// Derives the full keyset for one side's commitment transaction. The
/// revocation key comes from the counterparty's basepoint so only they can
/// punish.
pub fn derive_keyset(
    per_commitment_point: &PublicKey,
    side: &Basepoints,
    other: &Basepoints,
) -> Result<Keyset, KeyDerivationError> {
    Ok(Keyset {
        self_payment_key: derive_simple_key(&side.payment, per_commitment_point)?,
        other_payment_key: derive_simple_key(&other.payment, per_commitment_point)?,
        self_htlc_key: derive_simple_key(&side.htlc, per_commitment_point)?,
        other_htlc_key: derive_simple_key(&other.htlc, per_commitment_point)?,
        self_delayed_payment_key: derive_simple_key(&side.delayed_payment, per_commitment_point)?,
        self_revocation_key: derive_revocation_key(&other.revocation, per_commitment_point)?,
    })
}
