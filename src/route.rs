use crate::amount::MilliSatoshi;
use bitcoin::secp256k1::PublicKey;
use std::{cmp::Ordering, fmt, num::ParseIntError, str::FromStr};

/// Upper bound on route length requested from the routing service.
pub const ROUTING_MAX_HOPS: u32 = 20;

/// Compact identifier of a channel by its funding output position on-chain.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block: u32, txindex: u32, outnum: u16) -> Self {
        Self(
            (block as u64 & 0xFF_FFFF) << 40
                | (txindex as u64 & 0xFF_FFFF) << 16
                | outnum as u64,
        )
    }

    pub fn block(self) -> u32 {
        (self.0 >> 40) as u32 & 0xFF_FFFF
    }

    pub fn txindex(self) -> u32 {
        (self.0 >> 16) as u32 & 0xFF_FFFF
    }

    pub fn outnum(self) -> u16 {
        self.0 as u16
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ShortChannelId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.txindex(), self.outnum())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseShortChannelIdError {
    #[error("expected three `x`-separated fields")]
    WrongFieldCount,
    #[error("field is not a number")]
    NotANumber(#[from] ParseIntError),
}

impl FromStr for ShortChannelId {
    type Err = ParseShortChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split('x');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(block), Some(txindex), Some(outnum), None) => Ok(Self::new(
                block.parse()?,
                txindex.parse()?,
                outnum.parse()?,
            )),
            _ => Err(ParseShortChannelIdError::WrongFieldCount),
        }
    }
}

/// Per-hop payload encoding requested by the node at that hop.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopStyle {
    Legacy,
    Tlv,
}

/// One hop of a computed route.
///
/// `amount` is what is forwarded into this hop's channel (hop 0 therefore
/// carries the total including all fees), `delay` the outgoing CLTV
/// relative to the current tip.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct RouteHop {
    pub node_id: PublicKey,
    pub scid: ShortChannelId,
    pub direction: u8,
    pub amount: MilliSatoshi,
    pub delay: u32,
    pub style: HopStyle,
}

/// Entry excluded from route computation.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Exclusion {
    Channel { scid: ShortChannelId, direction: u8 },
    Node(PublicKey),
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Channel { scid, direction } => write!(f, "{}/{}", scid, direction),
            Exclusion::Node(node_id) => write!(f, "{}", node_id),
        }
    }
}

/// Request sent to the routing service.
#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub destination: PublicKey,
    pub amount: MilliSatoshi,
    pub cltv: u32,
    pub max_hops: u32,
    pub riskfactor: u32,
    pub exclude: Vec<Exclusion>,
}

/// One hop of an invoice-supplied routehint towards the destination:
/// `node_id` owns `scid` and charges the given fee for forwarding through
/// it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct RouteHintHop {
    pub node_id: PublicKey,
    pub scid: ShortChannelId,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

pub type RouteHint = Vec<RouteHintHop>;

/// Lexicographic order of the serialized keys, the tie-breaker gossip uses
/// to assign channel directions.
pub fn node_id_cmp(a: &PublicKey, b: &PublicKey) -> Ordering {
    a.serialize().cmp(&b.serialize())
}

/// Direction bit of the channel between `from` and `to`, as seen from
/// `from`.
pub fn channel_direction(from: &PublicKey, to: &PublicKey) -> u8 {
    if node_id_cmp(from, to) == Ordering::Greater {
        1
    } else {
        0
    }
}

/// The fee a route charges on top of the delivered amount.
pub fn route_fee(delivered: MilliSatoshi, route: &[RouteHop]) -> Option<MilliSatoshi> {
    route.first()?.amount.checked_sub(delivered)
}
