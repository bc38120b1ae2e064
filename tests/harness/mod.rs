//! In-process scripted collaborators for driving payments end-to-end
//! through the public API. Routes and `waitsendpay` results are queued up
//! front; every request the driver makes is recorded for inspection.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{PublicKey, Secp256k1, SecretKey},
};
use hermod::{
    payment::{BlockHeight, CreateOnion, GetRoute, ListPeerChannels, SendOnion, WaitSendPay},
    CreatedOnion, FailCode, HopStyle, MilliSatoshi, OnionRequest, PaymentParameters,
    PaymentResult, PaymentStatus, PeerChannel, Preimage, RouteHop, RouteRequest,
    SendOnionRequest, ShortChannelId, PAY_DESTINATION_PERM_FAIL, PAY_TRY_OTHER_ROUTE,
};
use std::{cell::RefCell, collections::VecDeque};

pub const START_BLOCK: u32 = 700_000;

#[derive(Default)]
pub struct Scripted {
    pub height: u32,
    pub peers: Vec<PeerChannel>,
    pub routes: RefCell<VecDeque<Result<Vec<RouteHop>>>>,
    pub default_route: Option<Vec<RouteHop>>,
    pub results: RefCell<VecDeque<PaymentResult>>,
    pub route_requests: RefCell<Vec<RouteRequest>>,
    pub onion_requests: RefCell<Vec<OnionRequest>>,
    pub sent: RefCell<Vec<SendOnionRequest>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self {
            height: START_BLOCK,
            ..Self::default()
        }
    }

    pub fn with_default_route(mut self, route: Vec<RouteHop>) -> Self {
        self.default_route = Some(route);
        self
    }

    pub fn push_route(&self, route: Vec<RouteHop>) {
        self.routes.borrow_mut().push_back(Ok(route));
    }

    pub fn push_result(&self, result: PaymentResult) {
        self.results.borrow_mut().push_back(result);
    }
}

#[async_trait(?Send)]
impl GetRoute for Scripted {
    async fn get_route(&self, request: RouteRequest) -> Result<Vec<RouteHop>> {
        self.route_requests.borrow_mut().push(request);

        if let Some(scripted) = self.routes.borrow_mut().pop_front() {
            return scripted;
        }
        if let Some(route) = &self.default_route {
            return Ok(route.clone());
        }
        Err(anyhow!("Could not find a route"))
    }
}

#[async_trait(?Send)]
impl CreateOnion for Scripted {
    async fn create_onion(&self, request: OnionRequest) -> Result<CreatedOnion> {
        let hops = request.hops.len();
        self.onion_requests.borrow_mut().push(request);

        Ok(CreatedOnion {
            onion: vec![0u8; 1366],
            shared_secrets: vec![[0u8; 32]; hops],
        })
    }
}

#[async_trait(?Send)]
impl SendOnion for Scripted {
    async fn send_onion(&self, request: SendOnionRequest) -> Result<()> {
        self.sent.borrow_mut().push(request);
        Ok(())
    }
}

#[async_trait(?Send)]
impl WaitSendPay for Scripted {
    async fn wait_send_pay(
        &self,
        _payment_hash: sha256::Hash,
        _partid: u64,
    ) -> Result<PaymentResult> {
        self.results
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no waitsendpay result scripted"))
    }
}

#[async_trait(?Send)]
impl BlockHeight for Scripted {
    async fn block_height(&self) -> Result<u32> {
        Ok(self.height)
    }
}

#[async_trait(?Send)]
impl ListPeerChannels for Scripted {
    async fn list_peer_channels(&self) -> Result<Vec<PeerChannel>> {
        Ok(self.peers.clone())
    }
}

pub fn seckey(seed: u8) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    SecretKey::from_slice(&bytes).expect("small scalars are valid keys")
}

pub fn pubkey(seed: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &seckey(seed))
}

pub fn payment_hash() -> sha256::Hash {
    sha256::Hash::hash(b"test payment")
}

/// Our node is `pubkey(1)`, the destination `pubkey(9)`.
pub fn params(amount_msat: u64) -> PaymentParameters {
    PaymentParameters::new(
        pubkey(9),
        payment_hash(),
        MilliSatoshi::from_msat(amount_msat),
        pubkey(1),
    )
}

pub fn hop(node: PublicKey, scid: u64, amount_msat: u64, delay: u32) -> RouteHop {
    RouteHop {
        node_id: node,
        scid: ShortChannelId::from(scid),
        direction: 0,
        amount: MilliSatoshi::from_msat(amount_msat),
        delay,
        style: HopStyle::Legacy,
    }
}

pub fn tlv_hop(node: PublicKey, scid: u64, amount_msat: u64, delay: u32) -> RouteHop {
    RouteHop {
        style: HopStyle::Tlv,
        ..hop(node, scid, amount_msat, delay)
    }
}

pub fn complete_result(amount_sent_msat: u64) -> PaymentResult {
    PaymentResult::complete(
        MilliSatoshi::from_msat(amount_sent_msat),
        Preimage::from_bytes([0x01; 32]),
    )
}

/// A failed `waitsendpay` record, with the error code `lightningd` would
/// pick: destination-terminal failures are permanent, everything else is
/// worth trying another route.
pub fn fail_result(failcode: FailCode, erring_index: u32) -> PaymentResult {
    let code = match failcode {
        FailCode::IncorrectOrUnknownPaymentDetails | FailCode::MppTimeout => {
            PAY_DESTINATION_PERM_FAIL
        }
        _ => PAY_TRY_OTHER_ROUTE,
    };

    PaymentResult {
        code,
        state: PaymentStatus::Failed,
        failcode: Some(failcode),
        message: format!("failed: {}", failcode.name()),
        erring_index: Some(erring_index),
        erring_node: None,
        erring_channel: None,
        erring_direction: None,
        raw_message: None,
        amount_sent: MilliSatoshi::ZERO,
        payment_preimage: None,
    }
}
