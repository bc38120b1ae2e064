use crate::transaction::Tx;
use bitcoin::{
    hashes::{sha256d, Hash},
    secp256k1::{self, Message, PublicKey, Secp256k1, SecretKey, Signature},
    Script,
};
use conquer_once::Lazy;

pub(crate) static SECP: Lazy<Secp256k1<secp256k1::All>> = Lazy::new(Secp256k1::new);

/// Sighash flag committed to by a transaction signature. Everything else
/// is rejected on sight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SighashType {
    All,
    SingleAnyoneCanPay,
}

impl SighashType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SighashType::All),
            0x83 => Some(SighashType::SingleAnyoneCanPay),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            SighashType::All => 0x01,
            SighashType::SingleAnyoneCanPay => 0x83,
        }
    }
}

/// An ECDSA signature paired with the sighash flag it commits to, the form
/// signatures take inside witness stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxSignature {
    pub signature: Signature,
    pub sighash_type: SighashType,
}

#[derive(Debug, thiserror::Error)]
pub enum DerError {
    #[error("signature encoding violates strict DER")]
    Encoding,
    #[error("unknown sighash byte {0:#04x}")]
    UnknownSighash(u8),
    #[error("signature s value is not low-S normalized")]
    HighS,
    #[error("secp256k1 rejected the signature: {0}")]
    Secp(#[from] secp256k1::Error),
}

impl TxSignature {
    /// Serializes as `DER || sighash-byte` (at most 73 bytes). The output
    /// is re-checked against the strict encoding rules so an encoder bug
    /// fails loudly here rather than in a script interpreter.
    pub fn to_der(&self) -> Vec<u8> {
        let mut der = self.signature.serialize_der().as_ref().to_vec();
        der.push(self.sighash_type.as_byte());

        assert!(
            is_valid_signature_encoding(&der),
            "emitted signature violates strict DER"
        );

        der
    }

    /// Strict inverse of [`TxSignature::to_der`]: every encoding rule is
    /// enforced, the trailing sighash byte must be a supported flag and
    /// the s value must already be low-S.
    pub fn from_der(bytes: &[u8]) -> Result<Self, DerError> {
        if !is_valid_signature_encoding(bytes) {
            return Err(DerError::Encoding);
        }

        let sighash_byte = bytes[bytes.len() - 1];
        let sighash_type =
            SighashType::from_byte(sighash_byte).ok_or(DerError::UnknownSighash(sighash_byte))?;

        let signature = Signature::from_der(&bytes[..bytes.len() - 1])?;

        let mut normalized = signature;
        normalized.normalize_s();
        if normalized != signature {
            return Err(DerError::HighS);
        }

        Ok(Self {
            signature,
            sighash_type,
        })
    }
}

/// Deterministic (RFC 6979) ECDSA over a 256-bit digest.
pub fn sign_hash(privkey: &SecretKey, digest: sha256d::Hash) -> Signature {
    let message = Message::from_slice(&digest.into_inner()).expect("digest is 32 bytes");

    SECP.sign(&message, privkey)
}

pub fn check_signed_hash(digest: sha256d::Hash, signature: &Signature, key: &PublicKey) -> bool {
    let message = Message::from_slice(&digest.into_inner()).expect("digest is 32 bytes");

    SECP.verify(&message, signature, key).is_ok()
}

/// Signs a segwit spend of `tx`'s input `index` with the given witness
/// script. The input's funding amount must have been recorded when the
/// input was added.
pub fn sign_tx_input(
    tx: &Tx,
    index: usize,
    witness_script: &Script,
    privkey: &SecretKey,
    sighash_type: SighashType,
) -> anyhow::Result<TxSignature> {
    let digest = tx.signature_digest(index, witness_script, sighash_type)?;

    Ok(TxSignature {
        signature: sign_hash(privkey, digest),
        sighash_type,
    })
}

/// Verifies a counterparty signature over a segwit spend of `tx`'s input
/// `index`.
pub fn check_tx_sig(
    tx: &Tx,
    index: usize,
    witness_script: &Script,
    key: &PublicKey,
    sig: &TxSignature,
) -> bool {
    let digest = match tx.signature_digest(index, witness_script, sig.sighash_type) {
        Ok(digest) => digest,
        Err(_) => return false,
    };

    check_signed_hash(digest, &sig.signature, key)
}

/// Strict signature encoding check, rule for rule the one consensus
/// applies to `DER || sighash` blobs.
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    // Format: 0x30 [total-length] 0x02 [R-length] [R] 0x02 [S-length] [S]
    // [sighash], with minimally-encoded positive R and S.
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }

    if sig[0] != 0x30 {
        return false;
    }

    if sig[1] as usize != sig.len() - 3 {
        return false;
    }

    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }

    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 {
        return false;
    }

    if len_r == 0 {
        return false;
    }

    if sig[4] & 0x80 != 0 {
        return false;
    }

    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 {
        return false;
    }

    if len_s == 0 {
        return false;
    }

    if sig[len_r + 6] & 0x80 != 0 {
        return false;
    }

    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }

    true
}
