use crate::{
    amount::MilliSatoshi,
    keys::{derive_keyset, Basepoints, KeyDerivationError},
    transaction::Tx,
};
use bitcoin::{
    blockdata::{opcodes, script::Builder},
    hashes::{hash160, sha256, Hash},
    secp256k1::PublicKey,
    Amount, OutPoint, Script,
};
use sha2::{Digest, Sha256};
use std::{fmt, ops::{Index, Not}};

/// Weight of an htlc-free commitment transaction, used to compute the fee
/// the funder owes.
const COMMITMENT_TX_WEIGHT: u64 = 724;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Not for Side {
    type Output = Side;

    fn not(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// A pair of values indexed by channel side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerSide<T> {
    pub local: T,
    pub remote: T,
}

impl<T> Index<Side> for PerSide<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

/// The per-side limits negotiated at channel open that the commitment
/// construction consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub dust_limit: Amount,
    pub to_self_delay: u16,
    pub channel_reserve: Amount,
}

/// One side's view of the channel: its feerate and who is owed what.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelView {
    pub feerate_per_kw: u32,
    pub owed: PerSide<MilliSatoshi>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("owed amounts {local} + {remote} do not add up to the funding of {funding}")]
    FundingMismatch {
        local: MilliSatoshi,
        remote: MilliSatoshi,
        funding: Amount,
    },
    #[error("funding amount overflows millisatoshi")]
    FundingOverflow,
    #[error("{0} funder cannot afford the commitment fee")]
    CannotAffordFee(Side),
    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),
}

/// The state seeding commitment-transaction construction for a freshly
/// funded channel. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct InitialChannel {
    pub funding_outpoint: OutPoint,
    pub funding: Amount,
    pub funder: Side,
    pub config: PerSide<ChannelConfig>,
    pub funding_pubkey: PerSide<PublicKey>,
    pub basepoints: PerSide<Basepoints>,
    pub view: PerSide<ChannelView>,
    pub commitment_number_obscurer: u64,
}

impl InitialChannel {
    /// Validates and assembles the channel seed. Fails when the two owed
    /// amounts do not add up to the funding output.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        funding_outpoint: OutPoint,
        funding: Amount,
        local_msat: MilliSatoshi,
        remote_msat: MilliSatoshi,
        feerate_per_kw: u32,
        config: PerSide<ChannelConfig>,
        funding_pubkey: PerSide<PublicKey>,
        basepoints: PerSide<Basepoints>,
        funder: Side,
    ) -> Result<Self, ChannelError> {
        let funding_msat =
            MilliSatoshi::from_sat(funding.as_sat()).ok_or(ChannelError::FundingOverflow)?;
        if local_msat.checked_add(remote_msat) != Some(funding_msat) {
            return Err(ChannelError::FundingMismatch {
                local: local_msat,
                remote: remote_msat,
                funding,
            });
        }

        let owed = PerSide {
            local: local_msat,
            remote: remote_msat,
        };
        let view = ChannelView {
            feerate_per_kw,
            owed,
        };

        let commitment_number_obscurer = commit_number_obscurer(
            &basepoints[funder].payment,
            &basepoints[!funder].payment,
        );

        Ok(Self {
            funding_outpoint,
            funding,
            funder,
            config,
            funding_pubkey,
            basepoints,
            view: PerSide {
                local: view,
                remote: view,
            },
            commitment_number_obscurer,
        })
    }

    /// Builds `side`'s initial (htlc-free) commitment transaction at
    /// obscured commitment number 0, along with the funding witness
    /// script it spends.
    pub fn initial_channel_tx(
        &self,
        per_commitment_point: &PublicKey,
        side: Side,
    ) -> Result<(Script, Tx), ChannelError> {
        let keyset = derive_keyset(
            per_commitment_point,
            &self.basepoints[side],
            &self.basepoints[!side],
        )?;

        let wscript =
            funding_witness_script(&self.funding_pubkey[side], &self.funding_pubkey[!side]);

        let view = &self.view[side];
        let fee_msat = commit_tx_base_fee(view.feerate_per_kw).as_sat() * 1000;

        let mut owed_to_side = view.owed[side].as_msat();
        let mut owed_to_other = view.owed[!side].as_msat();
        let funder_owed = if self.funder == side {
            &mut owed_to_side
        } else {
            &mut owed_to_other
        };
        *funder_owed = funder_owed
            .checked_sub(fee_msat)
            .ok_or(ChannelError::CannotAffordFee(self.funder))?;

        let dust_limit = self.config[side].dust_limit;
        // They specify our to_self_delay and vice versa.
        let to_self_delay = self.config[!side].to_self_delay;

        let mut outputs = Vec::with_capacity(2);

        let to_side = Amount::from_sat(owed_to_side / 1000);
        if to_side >= dust_limit {
            let script = to_local_script(
                &keyset.self_revocation_key,
                to_self_delay,
                &keyset.self_delayed_payment_key,
            );
            outputs.push((to_side, p2wsh(&script)));
        }

        let to_other = Amount::from_sat(owed_to_other / 1000);
        if to_other >= dust_limit {
            outputs.push((to_other, p2wpkh(&keyset.other_payment_key)));
        }

        // BIP69 output order, so both sides assemble the same transaction.
        outputs.sort_by(|(amount_a, script_a), (amount_b, script_b)| {
            amount_a
                .cmp(amount_b)
                .then_with(|| script_a.as_bytes().cmp(script_b.as_bytes()))
        });

        let commitment_number = 0u64;
        let obscured = commitment_number ^ self.commitment_number_obscurer;

        let mut tx = Tx::new();
        tx.lock_time = (0x2000_0000 | (obscured & 0xFF_FFFF)) as u32;
        tx.add_input(
            self.funding_outpoint.txid,
            self.funding_outpoint.vout,
            (0x8000_0000 | ((obscured >> 24) & 0xFF_FFFF)) as u32,
            Some(self.funding),
            Script::new(),
        );
        for (amount, script_pubkey) in outputs {
            tx.add_output(amount, script_pubkey);
        }

        Ok((wscript, tx))
    }
}

/// Low 48 bits of `SHA256(opener_payment_basepoint ||
/// accepter_payment_basepoint)`, XOR-ed into commitment numbers to hide
/// channel progress on-chain.
pub fn commit_number_obscurer(
    opener_payment_basepoint: &PublicKey,
    accepter_payment_basepoint: &PublicKey,
) -> u64 {
    let digest: [u8; 32] = Sha256::new()
        .chain(&opener_payment_basepoint.serialize()[..])
        .chain(&accepter_payment_basepoint.serialize()[..])
        .finalize()
        .into();

    digest[26..32]
        .iter()
        .fold(0u64, |obscurer, byte| (obscurer << 8) | *byte as u64)
}

/// 2-of-2 multisig over the funding keys, sorted lexicographically so both
/// sides derive the same script.
pub fn funding_witness_script(a: &PublicKey, b: &PublicKey) -> Script {
    let (first, second) = if a.serialize() <= b.serialize() {
        (a, b)
    } else {
        (b, a)
    };

    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_slice(&first.serialize())
        .push_slice(&second.serialize())
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

fn commit_tx_base_fee(feerate_per_kw: u32) -> Amount {
    Amount::from_sat(feerate_per_kw as u64 * COMMITMENT_TX_WEIGHT / 1000)
}

fn to_local_script(
    revocation_key: &PublicKey,
    to_self_delay: u16,
    delayed_payment_key: &PublicKey,
) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_IF)
        .push_slice(&revocation_key.serialize())
        .push_opcode(opcodes::all::OP_ELSE)
        .push_int(to_self_delay as i64)
        .push_opcode(opcodes::all::OP_CSV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_slice(&delayed_payment_key.serialize())
        .push_opcode(opcodes::all::OP_ENDIF)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .into_script()
}

fn p2wsh(script: &Script) -> Script {
    let hash = sha256::Hash::hash(script.as_bytes());
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&hash.into_inner())
        .into_script()
}

fn p2wpkh(key: &PublicKey) -> Script {
    let hash = hash160::Hash::hash(&key.serialize());
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&hash.into_inner())
        .into_script()
}
