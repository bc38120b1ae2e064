use crate::{
    amount::MilliSatoshi,
    payment::{PaymentResult, SharedState},
    route::RouteHop,
};
use log::debug;
use std::fmt;

const BADONION: u16 = 0x8000;
const PERM: u16 = 0x4000;
/// Codes below this implicate nobody on the route; the root surfaces them
/// as "no usable route" instead of a forwarding failure.
pub const NODE: u16 = 0x2000;
const UPDATE: u16 = 0x1000;

/// BOLT #4 onion failure codes. Severity comparisons go through
/// [`FailCode::to_wire`]; variant declaration order carries no meaning.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum FailCode {
    InvalidRealm = PERM | 1,
    TemporaryNodeFailure = NODE | 2,
    PermanentNodeFailure = PERM | NODE | 2,
    RequiredNodeFeatureMissing = PERM | NODE | 3,
    InvalidOnionVersion = BADONION | PERM | 4,
    InvalidOnionHmac = BADONION | PERM | 5,
    InvalidOnionKey = BADONION | PERM | 6,
    TemporaryChannelFailure = UPDATE | 7,
    PermanentChannelFailure = PERM | 8,
    RequiredChannelFeatureMissing = PERM | 9,
    UnknownNextPeer = PERM | 10,
    AmountBelowMinimum = UPDATE | 11,
    FeeInsufficient = UPDATE | 12,
    IncorrectCltvExpiry = UPDATE | 13,
    ExpiryTooSoon = UPDATE | 14,
    IncorrectOrUnknownPaymentDetails = PERM | 15,
    FinalIncorrectCltvExpiry = 18,
    FinalIncorrectHtlcAmount = 19,
    ChannelDisabled = UPDATE | 20,
    ExpiryTooFar = 21,
    InvalidOnionPayload = PERM | 22,
    MppTimeout = 23,
}

impl FailCode {
    pub fn from_wire(code: u16) -> Option<Self> {
        use FailCode::*;
        [
            InvalidRealm,
            TemporaryNodeFailure,
            PermanentNodeFailure,
            RequiredNodeFeatureMissing,
            InvalidOnionVersion,
            InvalidOnionHmac,
            InvalidOnionKey,
            TemporaryChannelFailure,
            PermanentChannelFailure,
            RequiredChannelFeatureMissing,
            UnknownNextPeer,
            AmountBelowMinimum,
            FeeInsufficient,
            IncorrectCltvExpiry,
            ExpiryTooSoon,
            IncorrectOrUnknownPaymentDetails,
            FinalIncorrectCltvExpiry,
            FinalIncorrectHtlcAmount,
            ChannelDisabled,
            ExpiryTooFar,
            InvalidOnionPayload,
            MppTimeout,
        ]
        .iter()
        .copied()
        .find(|candidate| *candidate as u16 == code)
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        use FailCode::*;
        match self {
            InvalidRealm => "WIRE_INVALID_REALM",
            TemporaryNodeFailure => "WIRE_TEMPORARY_NODE_FAILURE",
            PermanentNodeFailure => "WIRE_PERMANENT_NODE_FAILURE",
            RequiredNodeFeatureMissing => "WIRE_REQUIRED_NODE_FEATURE_MISSING",
            InvalidOnionVersion => "WIRE_INVALID_ONION_VERSION",
            InvalidOnionHmac => "WIRE_INVALID_ONION_HMAC",
            InvalidOnionKey => "WIRE_INVALID_ONION_KEY",
            TemporaryChannelFailure => "WIRE_TEMPORARY_CHANNEL_FAILURE",
            PermanentChannelFailure => "WIRE_PERMANENT_CHANNEL_FAILURE",
            RequiredChannelFeatureMissing => "WIRE_REQUIRED_CHANNEL_FEATURE_MISSING",
            UnknownNextPeer => "WIRE_UNKNOWN_NEXT_PEER",
            AmountBelowMinimum => "WIRE_AMOUNT_BELOW_MINIMUM",
            FeeInsufficient => "WIRE_FEE_INSUFFICIENT",
            IncorrectCltvExpiry => "WIRE_INCORRECT_CLTV_EXPIRY",
            ExpiryTooSoon => "WIRE_EXPIRY_TOO_SOON",
            IncorrectOrUnknownPaymentDetails => "WIRE_INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS",
            FinalIncorrectCltvExpiry => "WIRE_FINAL_INCORRECT_CLTV_EXPIRY",
            FinalIncorrectHtlcAmount => "WIRE_FINAL_INCORRECT_HTLC_AMOUNT",
            ChannelDisabled => "WIRE_CHANNEL_DISABLED",
            ExpiryTooFar => "WIRE_EXPIRY_TOO_FAR",
            InvalidOnionPayload => "WIRE_INVALID_ONION_PAYLOAD",
            MppTimeout => "WIRE_MPP_TIMEOUT",
        }
    }
}

impl fmt::Display for FailCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Feeds one negative `waitsendpay` result back into the shared root
/// state: disable or cap the implicated channel, exclude the reporting
/// node, or give up on the destination entirely.
pub(crate) fn classify_failure(
    shared: &mut SharedState,
    route: &[RouteHop],
    result: &PaymentResult,
) {
    use FailCode::*;

    let failcode = match result.failcode {
        Some(failcode) => failcode,
        None => return,
    };
    let erring_index = result.erring_index.unwrap_or(0) as usize;

    match failcode {
        PermanentChannelFailure
        | ChannelDisabled
        | UnknownNextPeer
        | RequiredChannelFeatureMissing => {
            if let Some(hop) = route.get(erring_index) {
                debug!("disabling channel {}/{}", hop.scid, hop.direction);
                shared.update_channel_hint(hop.scid, hop.direction, false, MilliSatoshi::ZERO);
            }
        }
        TemporaryChannelFailure => {
            if let Some(hop) = route.get(erring_index) {
                let estimate = MilliSatoshi::from_msat(hop.amount.as_msat() * 3 / 4);
                debug!(
                    "capping channel {}/{} at an estimated {}",
                    hop.scid, hop.direction, estimate
                );
                shared.update_channel_hint(hop.scid, hop.direction, true, estimate);
            }
        }
        InvalidOnionVersion
        | InvalidOnionHmac
        | InvalidOnionKey
        | PermanentNodeFailure
        | TemporaryNodeFailure
        | RequiredNodeFeatureMissing
        | InvalidRealm
        | InvalidOnionPayload => {
            // The reporter sits one hop before the erring index; index 0
            // would point back at ourselves.
            if erring_index >= 1 {
                if let Some(hop) = route.get(erring_index - 1) {
                    debug!("excluding node {}", hop.node_id);
                    shared.exclude_node(hop.node_id);
                }
            }
        }
        IncorrectOrUnknownPaymentDetails | MppTimeout => {
            debug!("destination failed the payment terminally, aborting");
            shared.abort = true;
        }
        AmountBelowMinimum
        | FeeInsufficient
        | IncorrectCltvExpiry
        | ExpiryTooSoon
        | ExpiryTooFar
        | FinalIncorrectCltvExpiry
        | FinalIncorrectHtlcAmount => {
            // Fee or CLTV precision mismatch; the next attempt may pick
            // better parameters, so leave the shared state alone.
        }
    }
}

/// Whether the failure recorded on a payment leaves room for another
/// attempt.
pub(crate) fn payment_can_retry(result: Option<&PaymentResult>) -> bool {
    use FailCode::*;

    let failcode = match result.and_then(|result| result.failcode) {
        Some(failcode) => failcode,
        None => return true,
    };

    match failcode {
        IncorrectOrUnknownPaymentDetails | MppTimeout => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_bolt4() {
        assert_eq!(FailCode::TemporaryChannelFailure.to_wire(), 0x1007);
        assert_eq!(FailCode::PermanentChannelFailure.to_wire(), 0x4008);
        assert_eq!(FailCode::UnknownNextPeer.to_wire(), 0x400a);
        assert_eq!(
            FailCode::IncorrectOrUnknownPaymentDetails.to_wire(),
            0x400f
        );
        assert_eq!(FailCode::TemporaryNodeFailure.to_wire(), 0x2002);
        assert_eq!(FailCode::InvalidOnionVersion.to_wire(), 0xc004);
        assert_eq!(FailCode::MppTimeout.to_wire(), 23);
    }

    #[test]
    fn wire_round_trip() {
        for code in &[
            FailCode::InvalidRealm,
            FailCode::TemporaryChannelFailure,
            FailCode::IncorrectOrUnknownPaymentDetails,
            FailCode::FinalIncorrectHtlcAmount,
        ] {
            assert_eq!(FailCode::from_wire(code.to_wire()), Some(*code));
        }
        assert_eq!(FailCode::from_wire(0xffff), None);
    }

    #[test]
    fn names_carry_the_wire_prefix() {
        assert_eq!(
            FailCode::ChannelDisabled.name(),
            "WIRE_CHANNEL_DISABLED"
        );
    }
}
