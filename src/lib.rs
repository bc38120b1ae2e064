#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![forbid(unsafe_code)]

//! An off-chain payment engine core: source-routed, onion-encrypted
//! payments driven through a tree of attempts, plus the segwit signing
//! core and initial channel state the channel machinery seeds from.

mod amount;
mod channel;
mod failure;
mod keys;
mod onion;
mod route;
mod signature;
mod transaction;

pub mod payment;

pub use ::bitcoin;
pub use amount::MilliSatoshi;
pub use channel::{
    commit_number_obscurer, funding_witness_script, ChannelConfig, ChannelError, ChannelView,
    InitialChannel, PerSide, Side,
};
pub use failure::FailCode;
pub use keys::{
    derive_keyset, derive_revocation_key, derive_simple_key, Basepoints, KeyDerivationError,
    Keyset,
};
pub use onion::{build_onion_request, CreatedOnion, OnionHop, OnionRequest};
pub use payment::{
    driver::PaymentDriver,
    modifiers::{default_modifiers, Modifier},
    ChannelHint, PaymentContext, PaymentOutcome, PaymentParameters, PaymentResult, PaymentSecret,
    PaymentStatus, PaymentStep, PeerChannel, Preimage, SendOnionRequest,
    PAY_DESTINATION_PERM_FAIL, PAY_ROUTE_NOT_FOUND, PAY_TRY_OTHER_ROUTE,
};
pub use route::{
    channel_direction, node_id_cmp, Exclusion, HopStyle, RouteHint, RouteHintHop, RouteHop,
    RouteRequest, ShortChannelId, ROUTING_MAX_HOPS,
};
pub use signature::{
    check_signed_hash, check_tx_sig, is_valid_signature_encoding, sign_hash, sign_tx_input,
    DerError, SighashType, TxSignature,
};
pub use transaction::{txid_from_hex, DigestError, ParseError, Tx, TxInput, TxOutput};
