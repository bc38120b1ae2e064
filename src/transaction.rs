use crate::signature::SighashType;
use bitcoin::{
    hashes::{hex::FromHex, sha256d, Hash},
    Amount, Script, Txid,
};
use std::convert::TryFrom;

const SEGREGATED_WITNESS_FLAG: u8 = 0x01;

/// A transaction input together with the funding amount of the output it
/// spends. The amount never hits the wire but BIP143 commits to it, so it
/// is captured when the input is added and carried until signing.
#[derive(Clone, Debug)]
pub struct TxInput {
    pub txid: Txid,
    pub vout: u32,
    pub sequence: u32,
    pub script_sig: Script,
    pub witness: Vec<Vec<u8>>,
    pub amount: Option<Amount>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOutput {
    pub amount: Amount,
    pub script_pubkey: Script,
}

/// A mutable transaction, serializable to and parseable from the BIP141/
/// BIP144 wire encoding.
#[derive(Clone, Debug, Default)]
pub struct Tx {
    pub version: i32,
    pub lock_time: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
}

/// Wire equality: everything that serializes. Input amounts are local
/// bookkeeping and excluded, so a parsed transaction compares equal to the
/// one that produced its bytes.
impl PartialEq for Tx {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.lock_time == other.lock_time
            && self.outputs == other.outputs
            && self.inputs.len() == other.inputs.len()
            && self.inputs.iter().zip(&other.inputs).all(|(a, b)| {
                a.txid == b.txid
                    && a.vout == b.vout
                    && a.sequence == b.sequence
                    && a.script_sig == b.script_sig
                    && a.witness == b.witness
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("transaction truncated")]
    UnexpectedEof,
    #[error("bad segwit flag {0:#04x}")]
    BadFlag(u8),
    #[error("non-minimal varint")]
    NonMinimalVarint,
    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),
    #[error("count {0} overflows the remaining bytes")]
    OversizedCount(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("no input at index {0}")]
    InputOutOfRange(usize),
    #[error("input {0} has no funding amount recorded")]
    MissingInputAmount(usize),
    #[error("SIGHASH_SINGLE input {0} has no matching output")]
    NoMatchingOutput(usize),
}

impl Tx {
    pub fn new() -> Self {
        Self {
            version: 2,
            lock_time: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(
        &mut self,
        txid: Txid,
        vout: u32,
        sequence: u32,
        amount: Option<Amount>,
        script_sig: Script,
    ) -> usize {
        self.inputs.push(TxInput {
            txid,
            vout,
            sequence,
            script_sig,
            witness: Vec::new(),
            amount,
        });
        self.inputs.len() - 1
    }

    pub fn add_output(&mut self, amount: Amount, script_pubkey: Script) -> usize {
        self.outputs.push(TxOutput {
            amount,
            script_pubkey,
        });
        self.outputs.len() - 1
    }

    pub fn set_input_witness(&mut self, index: usize, stack: Vec<Vec<u8>>) {
        self.inputs[index].witness = stack;
    }

    pub fn set_input_script(&mut self, index: usize, script: Script) {
        self.inputs[index].script_sig = script;
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// BIP144: the extended format is only used when some witness is
    /// non-empty.
    pub fn uses_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn linearize(&self, with_witness: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        let extended = with_witness && self.uses_witness();

        buf.extend_from_slice(&self.version.to_le_bytes());
        if extended {
            buf.push(0x00);
            buf.push(SEGREGATED_WITNESS_FLAG);
        }

        push_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.txid.into_inner());
            buf.extend_from_slice(&input.vout.to_le_bytes());
            push_varint_blob(&mut buf, input.script_sig.as_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        push_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            push_output(&mut buf, output);
        }

        if extended {
            for input in &self.inputs {
                push_varint(&mut buf, input.witness.len() as u64);
                for item in &input.witness {
                    push_varint_blob(&mut buf, item);
                }
            }
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// HASH256 of the witness-stripped serialization; witness data never
    /// affects the id.
    pub fn txid(&self) -> Txid {
        Txid::hash(&self.linearize(false))
    }

    /// BIP141 weight: non-witness bytes count four times, witness bytes
    /// (including the two-byte marker and flag) once.
    pub fn weight(&self) -> usize {
        let non_witness_len = self.linearize(false).len();
        let total_len = self.linearize(true).len();
        let witness_len = total_len - non_witness_len;

        non_witness_len * 4 + witness_len
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut cursor = Cursor::new(bytes);

        let version = i32::from_le_bytes(cursor.take_array::<4>()?);

        let mut flag = 0u8;
        let mut input_count = cursor.take_length(32 + 4 + 4 + 1)?;
        // BIP144 marker: a zero input count is impossible, it announces the
        // extended format instead.
        if input_count == 0 {
            flag = cursor.take_u8()?;
            if flag != SEGREGATED_WITNESS_FLAG {
                return Err(ParseError::BadFlag(flag));
            }
            input_count = cursor.take_length(32 + 4 + 4 + 1)?;
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let txid = Txid::from_slice(&cursor.take_array::<32>()?)
                .expect("txid is 32 bytes");
            let vout = u32::from_le_bytes(cursor.take_array::<4>()?);
            let script_len = cursor.take_length(1)?;
            let script_sig = Script::from(cursor.take(script_len as usize)?.to_vec());
            let sequence = u32::from_le_bytes(cursor.take_array::<4>()?);

            inputs.push(TxInput {
                txid,
                vout,
                sequence,
                script_sig,
                witness: Vec::new(),
                amount: None,
            });
        }

        let output_count = cursor.take_length(8 + 1)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let amount = Amount::from_sat(u64::from_le_bytes(cursor.take_array::<8>()?));
            let script_len = cursor.take_length(1)?;
            let script_pubkey = Script::from(cursor.take(script_len as usize)?.to_vec());

            outputs.push(TxOutput {
                amount,
                script_pubkey,
            });
        }

        if flag == SEGREGATED_WITNESS_FLAG {
            for input in &mut inputs {
                let items = cursor.take_length(1)?;
                let mut witness = Vec::with_capacity(items as usize);
                for _ in 0..items {
                    let item_len = cursor.take_length(1)?;
                    witness.push(cursor.take(item_len as usize)?.to_vec());
                }
                input.witness = witness;
            }
        }

        let lock_time = u32::from_le_bytes(cursor.take_array::<4>()?);

        let remaining = cursor.remaining();
        if remaining != 0 {
            return Err(ParseError::TrailingBytes(remaining));
        }

        Ok(Self {
            version,
            lock_time,
            inputs,
            outputs,
        })
    }

    /// Serialization sanity: parsing our own bytes and re-serializing must
    /// reproduce them bit for bit.
    pub fn check(&self) -> bool {
        let bytes = self.linearize(true);
        match Self::parse(&bytes) {
            Ok(parsed) => parsed.linearize(true) == bytes,
            Err(_) => false,
        }
    }

    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex.trim_end())?;
        Ok(Self::parse(&bytes)?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.linearize(true))
    }

    /// BIP143 signature digest for spending input `index` with
    /// `script_code`. The input's funding amount is part of the preimage;
    /// an input without one cannot be digested.
    pub fn signature_digest(
        &self,
        index: usize,
        script_code: &Script,
        sighash_type: SighashType,
    ) -> Result<sha256d::Hash, DigestError> {
        let input = self
            .inputs
            .get(index)
            .ok_or(DigestError::InputOutOfRange(index))?;
        let amount = input
            .amount
            .ok_or(DigestError::MissingInputAmount(index))?;

        let anyone_can_pay = sighash_type == SighashType::SingleAnyoneCanPay;

        let hash_prevouts = if anyone_can_pay {
            [0u8; 32]
        } else {
            let mut buf = Vec::new();
            for input in &self.inputs {
                buf.extend_from_slice(&input.txid.into_inner());
                buf.extend_from_slice(&input.vout.to_le_bytes());
            }
            sha256d::Hash::hash(&buf).into_inner()
        };

        let hash_sequence = if anyone_can_pay {
            [0u8; 32]
        } else {
            let mut buf = Vec::new();
            for input in &self.inputs {
                buf.extend_from_slice(&input.sequence.to_le_bytes());
            }
            sha256d::Hash::hash(&buf).into_inner()
        };

        let hash_outputs = match sighash_type {
            SighashType::All => {
                let mut buf = Vec::new();
                for output in &self.outputs {
                    push_output(&mut buf, output);
                }
                sha256d::Hash::hash(&buf).into_inner()
            }
            SighashType::SingleAnyoneCanPay => {
                let output = self
                    .outputs
                    .get(index)
                    .ok_or(DigestError::NoMatchingOutput(index))?;
                let mut buf = Vec::new();
                push_output(&mut buf, output);
                sha256d::Hash::hash(&buf).into_inner()
            }
        };

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&hash_prevouts);
        preimage.extend_from_slice(&hash_sequence);
        preimage.extend_from_slice(&input.txid.into_inner());
        preimage.extend_from_slice(&input.vout.to_le_bytes());
        push_varint_blob(&mut preimage, script_code.as_bytes());
        preimage.extend_from_slice(&amount.as_sat().to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&hash_outputs);
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&(sighash_type.as_byte() as u32).to_le_bytes());

        Ok(sha256d::Hash::hash(&preimage))
    }
}

/// Parses a txid from the RPC hex convention (byte-reversed).
pub fn txid_from_hex(hex: &str) -> anyhow::Result<Txid> {
    Ok(Txid::from_hex(hex)?)
}

fn push_output(buf: &mut Vec<u8>, output: &TxOutput) {
    buf.extend_from_slice(&output.amount.as_sat().to_le_bytes());
    push_varint_blob(buf, output.script_pubkey.as_bytes());
}

fn push_varint(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

fn push_varint_blob(buf: &mut Vec<u8>, blob: &[u8]) {
    push_varint(buf, blob.len() as u64);
    buf.extend_from_slice(blob);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let slice = self.take(N)?;
        Ok(<[u8; N]>::try_from(slice).expect("slice has requested length"))
    }

    fn take_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn take_varint(&mut self) -> Result<u64, ParseError> {
        let first = self.take_u8()?;
        let value = match first {
            0xfd => u16::from_le_bytes(self.take_array::<2>()?) as u64,
            0xfe => u32::from_le_bytes(self.take_array::<4>()?) as u64,
            0xff => u64::from_le_bytes(self.take_array::<8>()?),
            small => return Ok(small as u64),
        };

        let minimal_bound = match first {
            0xfd => 0xfd,
            0xfe => 0x1_0000,
            _ => 0x1_0000_0000,
        };
        if value < minimal_bound {
            return Err(ParseError::NonMinimalVarint);
        }
        Ok(value)
    }

    /// A varint announcing `count` items of at least `item_size` bytes;
    /// counts that cannot fit the remaining buffer are rejected before any
    /// allocation.
    fn take_length(&mut self, item_size: usize) -> Result<u64, ParseError> {
        let count = self.take_varint()?;
        let needed = count.checked_mul(item_size as u64);
        match needed {
            Some(needed) if needed <= self.remaining() as u64 => Ok(count),
            _ => Err(ParseError::OversizedCount(count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SighashType;
    use proptest::prelude::*;

    // The unsigned transaction from the BIP143 P2WPKH example.
    const BIP143_P2WPKH_TX: &str = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";

    #[test]
    fn parse_linearize_round_trip() {
        let tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();

        assert_eq!(tx.version, 1);
        assert_eq!(tx.lock_time, 17);
        assert_eq!(tx.inputs().len(), 2);
        assert_eq!(tx.outputs().len(), 2);
        assert_eq!(tx.to_hex(), BIP143_P2WPKH_TX);
        assert!(tx.check());
    }

    #[test]
    fn bip143_p2wpkh_digest_vector() {
        let mut tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();
        tx.inputs[1].amount = Some(Amount::from_sat(600_000_000));

        let script_code = Script::from(
            hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap(),
        );

        let digest = tx
            .signature_digest(1, &script_code, SighashType::All)
            .unwrap();

        assert_eq!(
            hex::encode(digest.into_inner()),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
    }

    #[test]
    fn digest_requires_input_amount() {
        let tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();

        let result = tx.signature_digest(1, &Script::new(), SighashType::All);

        assert!(matches!(result, Err(DigestError::MissingInputAmount(1))));
    }

    #[test]
    fn single_anyone_can_pay_ignores_other_inputs() {
        let mut tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();
        tx.inputs[0].amount = Some(Amount::from_sat(1_000_000));
        let script_code = Script::from(vec![0x51]);

        let before = tx
            .signature_digest(0, &script_code, SighashType::SingleAnyoneCanPay)
            .unwrap();

        // Mutating the other input or the other output must not move the
        // digest; mutating our own output must.
        tx.inputs[1].sequence = 0;
        tx.outputs[1].amount = Amount::from_sat(1);
        let after = tx
            .signature_digest(0, &script_code, SighashType::SingleAnyoneCanPay)
            .unwrap();
        assert_eq!(before, after);

        tx.outputs[0].amount = Amount::from_sat(1);
        let moved = tx
            .signature_digest(0, &script_code, SighashType::SingleAnyoneCanPay)
            .unwrap();
        assert_ne!(before, moved);
    }

    #[test]
    fn txid_is_witness_independent() {
        let mut tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();
        let txid_before = tx.txid();

        tx.set_input_witness(0, vec![vec![0xaa; 71], vec![0xbb; 33]]);

        assert_eq!(tx.txid(), txid_before);
        assert_ne!(tx.linearize(true), tx.linearize(false));
    }

    #[test]
    fn weight_counts_witness_bytes_once() {
        let mut tx = Tx::from_hex(BIP143_P2WPKH_TX).unwrap();
        let stripped_len = tx.linearize(false).len();
        assert_eq!(tx.weight(), stripped_len * 4);

        tx.set_input_witness(0, vec![vec![0xaa; 4]]);
        // marker + flag + two witness stack counts + one item (varint + 4)
        let witness_len = 2 + 1 + 1 + 1 + 4;
        assert_eq!(tx.weight(), stripped_len * 4 + witness_len);
    }

    #[test]
    fn witness_round_trip() {
        let mut tx = Tx::new();
        tx.add_input(
            Txid::hash(b"funding"),
            1,
            0xffff_fffd,
            Some(Amount::from_sat(5_000)),
            Script::new(),
        );
        tx.add_output(Amount::from_sat(4_000), Script::from(vec![0x00, 0x14]));
        tx.set_input_script(0, Script::from(vec![0x51]));
        tx.set_input_witness(0, vec![vec![], vec![0x01, 0x02], vec![0xff; 73]]);

        let parsed = Tx::parse(&tx.linearize(true)).unwrap();

        assert_eq!(parsed, tx);
        assert_eq!(parsed.inputs()[0].witness, tx.inputs()[0].witness);
        assert_eq!(parsed.inputs()[0].amount, None);
        assert!(tx.check());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = hex::decode(BIP143_P2WPKH_TX).unwrap();
        bytes.push(0x00);

        assert!(matches!(
            Tx::parse(&bytes),
            Err(ParseError::TrailingBytes(1))
        ));
    }

    #[test]
    fn rejects_oversized_counts() {
        // Version followed by a varint input count far beyond the buffer.
        let mut bytes = vec![0x02, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff, 0x7f]);

        assert!(matches!(
            Tx::parse(&bytes),
            Err(ParseError::OversizedCount(_))
        ));
    }

    prop_compose! {
        fn arb_input()(
            txid_seed in prop::array::uniform32(any::<u8>()),
            vout in any::<u32>(),
            sequence in any::<u32>(),
            script in prop::collection::vec(any::<u8>(), 0..40),
            witness in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..3),
        ) -> TxInput {
            TxInput {
                txid: Txid::hash(&txid_seed),
                vout,
                sequence,
                script_sig: Script::from(script),
                witness,
                amount: None,
            }
        }
    }

    prop_compose! {
        fn arb_output()(
            amount in 0u64..21_000_000_0000_0000,
            script in prop::collection::vec(any::<u8>(), 0..40),
        ) -> TxOutput {
            TxOutput {
                amount: Amount::from_sat(amount),
                script_pubkey: Script::from(script),
            }
        }
    }

    proptest! {
        #[test]
        fn round_trip_any_tx(
            version in any::<i32>(),
            lock_time in any::<u32>(),
            inputs in prop::collection::vec(arb_input(), 1..4),
            outputs in prop::collection::vec(arb_output(), 0..4),
        ) {
            let mut tx = Tx::new();
            tx.version = version;
            tx.lock_time = lock_time;
            for input in inputs {
                let index = tx.add_input(input.txid, input.vout, input.sequence, None, input.script_sig);
                tx.set_input_witness(index, input.witness);
            }
            for output in outputs {
                tx.add_output(output.amount, output.script_pubkey);
            }

            let parsed = Tx::parse(&tx.linearize(true)).unwrap();
            prop_assert_eq!(&parsed, &tx);
            prop_assert_eq!(parsed.linearize(true), tx.linearize(true));
            prop_assert!(tx.check());
        }
    }
}
