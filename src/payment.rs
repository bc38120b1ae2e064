pub mod driver;
pub mod modifiers;

use crate::{
    amount::MilliSatoshi,
    failure::FailCode,
    onion::{CreatedOnion, OnionRequest},
    route::{Exclusion, RouteHint, RouteHop, RouteRequest, ShortChannelId, ROUTING_MAX_HOPS},
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bitcoin::{hashes::sha256, secp256k1::PublicKey};
use enum_as_inner::EnumAsInner;
use log::info;
use std::{
    any::Any,
    cell::{Ref, RefCell, RefMut},
    fmt,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

/// JSON-RPC error code for "no usable route left".
pub const PAY_ROUTE_NOT_FOUND: u32 = 205;
/// JSON-RPC error code for a forwarding failure worth retrying elsewhere.
pub const PAY_TRY_OTHER_ROUTE: u32 = 204;
/// JSON-RPC error code for a terminal failure at the destination.
pub const PAY_DESTINATION_PERM_FAIL: u32 = 203;

/// Lifecycle step of a payment attempt.
///
/// The discriminants are bits so that the steps of a whole subtree can be
/// OR-ed into a compact summary during result collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PaymentStep {
    Initialized = 1,
    GotRoute = 2,
    OnionPayload = 4,
    Split = 8,
    Retry = 16,
    Success = 32,
    Failed = 64,
}

impl PaymentStep {
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// Terminal for this node, with no children carrying on.
    pub fn is_final(self) -> bool {
        matches!(self, PaymentStep::Success | PaymentStep::Failed)
    }

    /// Terminal for this node, but parenthood-bearing: children continue
    /// the payment.
    pub fn is_branch(self) -> bool {
        matches!(self, PaymentStep::Retry | PaymentStep::Split)
    }
}

const PENDING_STEPS: u8 =
    PaymentStep::Initialized as u8 | PaymentStep::GotRoute as u8 | PaymentStep::OnionPayload as u8;

/// Proof of payment.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({})", hex::encode(self.0))
    }
}

impl fmt::Display for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Secret from the invoice, proving the payment went through the intended
/// recipient and binding MPP parts together.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PaymentSecret([u8; 32]);

impl PaymentSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PaymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecret(..)")
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Complete,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => f.write_str("pending"),
            PaymentStatus::Complete => f.write_str("complete"),
            PaymentStatus::Failed => f.write_str("failed"),
        }
    }
}

/// The resolution record of one sent attempt, as observed via
/// `waitsendpay`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentResult {
    pub code: u32,
    pub state: PaymentStatus,
    pub failcode: Option<FailCode>,
    pub message: String,
    pub erring_index: Option<u32>,
    pub erring_node: Option<PublicKey>,
    pub erring_channel: Option<ShortChannelId>,
    pub erring_direction: Option<u8>,
    pub raw_message: Option<Vec<u8>>,
    pub amount_sent: MilliSatoshi,
    pub payment_preimage: Option<Preimage>,
}

impl PaymentResult {
    pub fn complete(amount_sent: MilliSatoshi, payment_preimage: Preimage) -> Self {
        Self {
            code: 0,
            state: PaymentStatus::Complete,
            failcode: None,
            message: String::new(),
            erring_index: None,
            erring_node: None,
            erring_channel: None,
            erring_direction: None,
            raw_message: None,
            amount_sent,
            payment_preimage: Some(payment_preimage),
        }
    }

    /// A failure produced by ourselves before anything hit the wire: no
    /// forwarding node is implicated, so there is no failcode.
    pub(crate) fn local_failure(message: String) -> Self {
        Self {
            code: PAY_ROUTE_NOT_FOUND,
            state: PaymentStatus::Failed,
            failcode: None,
            message,
            erring_index: None,
            erring_node: None,
            erring_channel: None,
            erring_direction: None,
            raw_message: None,
            amount_sent: MilliSatoshi::ZERO,
            payment_preimage: None,
        }
    }

    pub fn failcodename(&self) -> Option<&'static str> {
        self.failcode.map(FailCode::name)
    }

    fn severity(&self) -> u16 {
        self.failcode.map(FailCode::to_wire).unwrap_or(0)
    }
}

/// Current belief about a directed channel, learned from failures and
/// local topology.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelHint {
    pub scid: ShortChannelId,
    pub direction: u8,
    pub enabled: bool,
    pub estimated_capacity: MilliSatoshi,
}

/// State shared by a whole payment tree, owned by the root and reachable
/// from every node. All mutations are monotonic: hints only get more
/// pessimistic, nodes are only ever added to the exclusion list.
#[derive(Debug)]
pub struct SharedState {
    pub local_id: PublicKey,
    pub channel_hints: Vec<ChannelHint>,
    pub excluded_nodes: Vec<PublicKey>,
    pub abort: bool,
    next_partid: u64,
    next_id: u64,
}

impl SharedState {
    pub(crate) fn new(local_id: PublicKey) -> Self {
        Self {
            local_id,
            channel_hints: Vec::new(),
            excluded_nodes: Vec::new(),
            abort: false,
            next_partid: 1,
            next_id: 1,
        }
    }

    /// Adds or tightens the hint for a directed channel. A disabled hint
    /// never becomes enabled again and capacity estimates only shrink.
    pub fn update_channel_hint(
        &mut self,
        scid: ShortChannelId,
        direction: u8,
        enabled: bool,
        estimated_capacity: MilliSatoshi,
    ) {
        if let Some(hint) = self
            .channel_hints
            .iter_mut()
            .find(|hint| hint.scid == scid && hint.direction == direction)
        {
            hint.enabled &= enabled;
            hint.estimated_capacity = hint.estimated_capacity.min(estimated_capacity);
            return;
        }

        self.channel_hints.push(ChannelHint {
            scid,
            direction,
            enabled,
            estimated_capacity,
        });
    }

    pub fn exclude_node(&mut self, node_id: PublicKey) {
        if !self.excluded_nodes.contains(&node_id) {
            self.excluded_nodes.push(node_id);
        }
    }

    /// The exclusion list for a route request moving `amount`: disabled
    /// channels, channels believed too small, and excluded nodes.
    pub fn exclusions(&self, amount: MilliSatoshi) -> Vec<Exclusion> {
        self.channel_hints
            .iter()
            .filter(|hint| !hint.enabled || amount >= hint.estimated_capacity)
            .map(|hint| Exclusion::Channel {
                scid: hint.scid,
                direction: hint.direction,
            })
            .chain(self.excluded_nodes.iter().copied().map(Exclusion::Node))
            .collect()
    }
}

/// What the caller asks for: where to, how much, and under which budgets.
#[derive(Clone, Debug)]
pub struct PaymentParameters {
    pub destination: PublicKey,
    pub payment_hash: sha256::Hash,
    pub amount: MilliSatoshi,
    pub local_id: PublicKey,
    pub fee_budget: MilliSatoshi,
    pub cltv_budget: u32,
    pub min_final_cltv_expiry: u32,
    pub payment_secret: Option<PaymentSecret>,
    pub route_hints: Vec<RouteHint>,
    pub bolt11: Option<String>,
}

impl PaymentParameters {
    /// Defaults: half a percent fee budget with a 5000msat floor, the
    /// usual 2016-block CLTV ceiling and the BOLT11 default final delta.
    pub fn new(
        destination: PublicKey,
        payment_hash: sha256::Hash,
        amount: MilliSatoshi,
        local_id: PublicKey,
    ) -> Self {
        let fee_budget = MilliSatoshi::from_msat((amount.as_msat() / 200).max(5_000));

        Self {
            destination,
            payment_hash,
            amount,
            local_id,
            fee_budget,
            cltv_budget: 2016,
            min_final_cltv_expiry: 9,
            payment_secret: None,
            route_hints: Vec::new(),
            bolt11: None,
        }
    }
}

/// The route request this attempt will make; modifiers adjust it before
/// the routing service is asked.
#[derive(Clone, Debug)]
pub struct RouteParameters {
    pub destination: PublicKey,
    pub amount: MilliSatoshi,
    pub cltv: u32,
    pub max_hops: u32,
}

impl RouteParameters {
    pub(crate) fn request(&self, exclude: Vec<Exclusion>) -> RouteRequest {
        RouteRequest {
            destination: self.destination,
            amount: self.amount,
            cltv: self.cltv,
            max_hops: self.max_hops,
            riskfactor: 1,
            exclude,
        }
    }
}

/// One node of the payment attempt tree.
///
/// The root is the caller's payment; children are retries or MPP parts of
/// their parent and share the root's [`SharedState`].
pub struct Payment {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub partid: u64,
    pub destination: PublicKey,
    pub payment_hash: sha256::Hash,
    pub amount: MilliSatoshi,
    pub total_msat: MilliSatoshi,
    pub fee_budget: MilliSatoshi,
    pub cltv_budget: u32,
    pub min_final_cltv_expiry: u32,
    pub payment_secret: Option<PaymentSecret>,
    pub route_hints: Vec<RouteHint>,
    pub bolt11: Option<String>,
    pub start_block: u32,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub step: PaymentStep,
    pub getroute: RouteParameters,
    pub route: Option<Vec<RouteHop>>,
    pub createonion: Option<OnionRequest>,
    pub result: Option<PaymentResult>,
    pub children: Vec<Payment>,
    pub(crate) shared: Rc<RefCell<SharedState>>,
    pub(crate) modifier_data: Vec<Box<dyn Any>>,
    pub(crate) current_modifier: Option<usize>,
}

impl Payment {
    pub(crate) fn new_root(params: PaymentParameters) -> Self {
        let shared = Rc::new(RefCell::new(SharedState::new(params.local_id)));

        Self {
            id: 0,
            parent_id: None,
            partid: 0,
            destination: params.destination,
            payment_hash: params.payment_hash,
            amount: params.amount,
            total_msat: params.amount,
            fee_budget: params.fee_budget,
            cltv_budget: params.cltv_budget,
            min_final_cltv_expiry: params.min_final_cltv_expiry,
            payment_secret: params.payment_secret,
            route_hints: params.route_hints,
            bolt11: params.bolt11,
            start_block: 0,
            start_time: SystemTime::now(),
            end_time: None,
            step: PaymentStep::Initialized,
            getroute: RouteParameters {
                destination: params.destination,
                amount: params.amount,
                cltv: params.min_final_cltv_expiry,
                max_hops: ROUTING_MAX_HOPS,
            },
            route: None,
            createonion: None,
            result: None,
            children: Vec::new(),
            shared,
            modifier_data: Vec::new(),
            current_modifier: None,
        }
    }

    /// Appends a child continuing this payment: same destination, hash and
    /// budgets, fresh attempt state, next partition id from the root.
    pub fn spawn_child(&mut self) -> &mut Payment {
        let (id, partid) = {
            let mut shared = self.shared.borrow_mut();
            let id = shared.next_id;
            shared.next_id += 1;
            let partid = shared.next_partid;
            shared.next_partid += 1;
            (id, partid)
        };

        let child = Payment {
            id,
            parent_id: Some(self.id),
            partid,
            destination: self.destination,
            payment_hash: self.payment_hash,
            amount: self.amount,
            total_msat: self.total_msat,
            fee_budget: self.fee_budget,
            cltv_budget: self.cltv_budget,
            min_final_cltv_expiry: self.min_final_cltv_expiry,
            payment_secret: self.payment_secret,
            route_hints: self.route_hints.clone(),
            bolt11: self.bolt11.clone(),
            start_block: self.start_block,
            start_time: SystemTime::now(),
            end_time: None,
            step: PaymentStep::Initialized,
            getroute: RouteParameters {
                destination: self.destination,
                amount: self.amount,
                cltv: self.min_final_cltv_expiry,
                max_hops: ROUTING_MAX_HOPS,
            },
            route: None,
            createonion: None,
            result: None,
            children: Vec::new(),
            shared: Rc::clone(&self.shared),
            modifier_data: Vec::new(),
            current_modifier: None,
        };

        self.children.push(child);
        self.children.last_mut().expect("child just pushed")
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn shared(&self) -> Ref<'_, SharedState> {
        self.shared.borrow()
    }

    pub(crate) fn shared_mut(&self) -> RefMut<'_, SharedState> {
        self.shared.borrow_mut()
    }

    pub fn aborted(&self) -> bool {
        self.shared.borrow().abort
    }

    /// Fails this attempt before (or without) anything reaching the wire.
    /// The route, if any, stays recorded so the retry policy can see it.
    pub(crate) fn fail_local(&mut self, message: String) {
        log::debug!("payment {} part {} failed: {}", self.id, self.partid, message);
        self.result = Some(PaymentResult::local_failure(message));
        self.step = PaymentStep::Failed;
    }
}

impl fmt::Debug for Payment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payment")
            .field("id", &self.id)
            .field("partid", &self.partid)
            .field("destination", &self.destination)
            .field("amount", &self.amount)
            .field("step", &self.step)
            .field("route", &self.route)
            .field("result", &self.result)
            .field("children", &self.children)
            .finish()
    }
}

/// Post-order summary of a payment subtree.
#[derive(Clone, Debug)]
pub struct CollectedResult {
    pub sent: MilliSatoshi,
    pub preimage: Option<Preimage>,
    pub leafstates: u8,
    pub treestates: u8,
    pub attempts: u32,
    pub failure: Option<PaymentResult>,
}

/// Walks the subtree rooted in `payment` and aggregates what happened:
/// how much made it out, the first preimage seen, the OR of all (leaf)
/// steps, the number of attempts that got as far as a route, and the most
/// severe failure.
pub fn collect(payment: &Payment) -> Result<CollectedResult> {
    let mut collected = CollectedResult {
        sent: MilliSatoshi::ZERO,
        preimage: None,
        leafstates: 0,
        treestates: payment.step.bit(),
        attempts: payment.route.is_some() as u32,
        failure: None,
    };

    if payment.children.is_empty() {
        collected.leafstates = payment.step.bit();
        if let Some(result) = &payment.result {
            if result.state == PaymentStatus::Complete {
                collected.sent = result.amount_sent;
                collected.preimage = result.payment_preimage;
            }
        }
    }

    if let Some(result) = &payment.result {
        if result.state == PaymentStatus::Failed {
            collected.failure = Some(result.clone());
        }
    }

    for child in &payment.children {
        let sub = collect(child)?;

        collected.sent = match collected.sent.checked_add(sub.sent) {
            Some(sent) => sent,
            None => bail!("sent amount overflows while collecting results"),
        };
        collected.preimage = collected.preimage.or(sub.preimage);
        collected.leafstates |= sub.leafstates;
        collected.treestates |= sub.treestates;
        collected.attempts += sub.attempts;
        collected.failure = match (collected.failure.take(), sub.failure) {
            (None, sub) => sub,
            (own, None) => own,
            (Some(own), Some(sub)) => {
                // Strictly greater keeps the first-seen failure on ties.
                if sub.severity() > own.severity() {
                    Some(sub)
                } else {
                    Some(own)
                }
            }
        };
    }

    Ok(collected)
}

/// The single answer surfaced to the caller for a root payment.
#[derive(Clone, Debug, EnumAsInner)]
pub enum PaymentOutcome {
    Success(PaymentSuccess),
    Failure(PaymentFailure),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct PaymentSuccess {
    pub payment_hash: sha256::Hash,
    pub destination: PublicKey,
    pub created_at: u64,
    pub parts: u32,
    pub amount_msat: MilliSatoshi,
    pub amount_sent_msat: MilliSatoshi,
    pub payment_preimage: Preimage,
    pub status: PaymentStatus,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct PaymentFailure {
    pub code: u32,
    pub message: String,
    pub bolt11: Option<String>,
    pub created_at: u64,
    pub destination: PublicKey,
    pub payment_hash: sha256::Hash,
    pub failcode: Option<FailCode>,
    pub erring_index: Option<u32>,
    pub erring_node: Option<PublicKey>,
    pub erring_channel: Option<ShortChannelId>,
    pub erring_direction: Option<u8>,
    pub status: PaymentStatus,
    pub amount_msat: MilliSatoshi,
    pub amount_sent_msat: MilliSatoshi,
    pub attempts: u32,
}

impl PaymentFailure {
    pub fn failcodename(&self) -> Option<&'static str> {
        self.failcode.map(FailCode::name)
    }
}

/// Computes the caller-facing outcome of a finished root payment.
pub(crate) fn root_outcome(root: &Payment) -> Result<PaymentOutcome> {
    let collected = collect(root)?;
    let created_at = epoch_seconds(root.start_time);

    if collected.leafstates & PaymentStep::Success.bit() != 0 {
        let payment_preimage = collected
            .preimage
            .ok_or_else(|| anyhow!("successful payment without a preimage"))?;
        info!(
            "payment {} complete: delivered {} in {} part(s), sent {}",
            root.payment_hash, root.amount, collected.attempts, collected.sent
        );

        return Ok(PaymentOutcome::Success(PaymentSuccess {
            payment_hash: root.payment_hash,
            destination: root.destination,
            created_at,
            parts: collected.attempts,
            amount_msat: root.amount,
            amount_sent_msat: collected.sent,
            payment_preimage,
            status: PaymentStatus::Complete,
        }));
    }

    let failure = match collected.failure {
        Some(failure) if failure.severity() >= crate::failure::NODE => failure,
        _ => {
            // Nothing on the route ever got blamed: we simply could not
            // find a way to get the funds there.
            let message = format!(
                "Ran out of routes to try after {} attempt{}: see `paystatus`",
                collected.attempts,
                if collected.attempts == 1 { "" } else { "s" }
            );
            info!("payment {} failed: {}", root.payment_hash, message);

            return Ok(PaymentOutcome::Failure(PaymentFailure {
                code: PAY_ROUTE_NOT_FOUND,
                message,
                bolt11: root.bolt11.clone(),
                created_at,
                destination: root.destination,
                payment_hash: root.payment_hash,
                failcode: None,
                erring_index: None,
                erring_node: None,
                erring_channel: None,
                erring_direction: None,
                status: PaymentStatus::Failed,
                amount_msat: root.amount,
                amount_sent_msat: collected.sent,
                attempts: collected.attempts,
            }));
        }
    };

    let status = if collected.leafstates & PENDING_STEPS != 0 {
        PaymentStatus::Pending
    } else {
        PaymentStatus::Failed
    };
    info!(
        "payment {} failed ({}): {}",
        root.payment_hash,
        failure.failcodename().unwrap_or("unknown"),
        failure.message
    );

    Ok(PaymentOutcome::Failure(PaymentFailure {
        code: failure.code,
        message: failure.message.clone(),
        bolt11: root.bolt11.clone(),
        created_at,
        destination: root.destination,
        payment_hash: root.payment_hash,
        failcode: failure.failcode,
        erring_index: failure.erring_index,
        erring_node: failure.erring_node,
        erring_channel: failure.erring_channel,
        erring_direction: failure.erring_direction,
        status,
        amount_msat: root.amount,
        amount_sent_msat: collected.sent,
        attempts: collected.attempts,
    }))
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Channel of ours as reported by local topology, used to seed the root's
/// channel hints.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerChannel {
    pub scid: ShortChannelId,
    pub direction: u8,
    pub spendable_msat: MilliSatoshi,
    pub connected: bool,
}

/// HTLC dispatch request: the onion plus the hop it leaves through.
#[derive(Clone, Debug)]
pub struct SendOnionRequest {
    pub onion: Vec<u8>,
    pub first_hop: RouteHop,
    pub payment_hash: sha256::Hash,
    pub shared_secrets: Vec<[u8; 32]>,
    pub partid: u64,
}

#[async_trait(?Send)]
pub trait GetRoute {
    async fn get_route(&self, request: RouteRequest) -> Result<Vec<RouteHop>>;
}

#[async_trait(?Send)]
pub trait CreateOnion {
    async fn create_onion(&self, request: OnionRequest) -> Result<CreatedOnion>;
}

#[async_trait(?Send)]
pub trait SendOnion {
    async fn send_onion(&self, request: SendOnionRequest) -> Result<()>;
}

#[async_trait(?Send)]
pub trait WaitSendPay {
    async fn wait_send_pay(
        &self,
        payment_hash: sha256::Hash,
        partid: u64,
    ) -> Result<PaymentResult>;
}

#[async_trait(?Send)]
pub trait BlockHeight {
    async fn block_height(&self) -> Result<u32>;
}

#[async_trait(?Send)]
pub trait ListPeerChannels {
    async fn list_peer_channels(&self) -> Result<Vec<PeerChannel>>;
}

/// Everything the driver needs from its collaborators.
pub trait PaymentContext:
    GetRoute + CreateOnion + SendOnion + WaitSendPay + BlockHeight + ListPeerChannels
{
}

impl<T> PaymentContext for T where
    T: GetRoute + CreateOnion + SendOnion + WaitSendPay + BlockHeight + ListPeerChannels
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys;
    use bitcoin::hashes::Hash;

    fn test_params() -> PaymentParameters {
        PaymentParameters::new(
            test_keys::pubkey(9),
            sha256::Hash::hash(b"invoice"),
            MilliSatoshi::from_msat(100_000),
            test_keys::pubkey(1),
        )
    }

    #[test]
    fn partition_ids_are_unique_across_the_tree() {
        let mut root = Payment::new_root(test_params());
        assert_eq!(root.partid, 0);

        root.spawn_child();
        let grandchild_partid = root.children[0].spawn_child().partid;

        let mut partids = vec![root.partid, root.children[0].partid, grandchild_partid];
        partids.sort_unstable();
        partids.dedup();
        assert_eq!(partids.len(), 3);
    }

    #[test]
    fn children_share_the_root_state() {
        let mut root = Payment::new_root(test_params());
        let child = root.spawn_child();

        child
            .shared_mut()
            .update_channel_hint(ShortChannelId::from(7), 0, false, MilliSatoshi::ZERO);
        assert_eq!(child.parent_id, Some(0));

        assert_eq!(root.shared().channel_hints.len(), 1);
    }

    #[test]
    fn hint_updates_are_monotonic() {
        let mut shared = SharedState::new(test_keys::pubkey(1));
        let scid = ShortChannelId::new(1, 1, 1);

        shared.update_channel_hint(scid, 0, true, MilliSatoshi::from_msat(10_000));
        shared.update_channel_hint(scid, 0, false, MilliSatoshi::from_msat(20_000));
        // Once disabled, no later observation may re-enable it or grow the
        // capacity estimate.
        shared.update_channel_hint(scid, 0, true, MilliSatoshi::from_msat(30_000));

        assert_eq!(shared.channel_hints.len(), 1);
        let hint = &shared.channel_hints[0];
        assert!(!hint.enabled);
        assert_eq!(hint.estimated_capacity, MilliSatoshi::from_msat(10_000));
    }

    #[test]
    fn exclusions_cover_disabled_and_undersized_channels() {
        let mut shared = SharedState::new(test_keys::pubkey(1));
        shared.update_channel_hint(ShortChannelId::from(1), 0, false, MilliSatoshi::ZERO);
        shared.update_channel_hint(ShortChannelId::from(2), 1, true, MilliSatoshi::from_msat(500));
        shared.update_channel_hint(
            ShortChannelId::from(3),
            0,
            true,
            MilliSatoshi::from_msat(5_000),
        );
        shared.exclude_node(test_keys::pubkey(5));

        let exclusions = shared.exclusions(MilliSatoshi::from_msat(1_000));

        assert_eq!(exclusions.len(), 3);
        assert!(exclusions.contains(&Exclusion::Channel {
            scid: ShortChannelId::from(1),
            direction: 0
        }));
        assert!(exclusions.contains(&Exclusion::Channel {
            scid: ShortChannelId::from(2),
            direction: 1
        }));
        assert!(exclusions.contains(&Exclusion::Node(test_keys::pubkey(5))));
    }

    #[test]
    fn collect_sums_only_completed_leaves() {
        let mut root = Payment::new_root(test_params());
        root.step = PaymentStep::Retry;
        root.route = Some(Vec::new());

        let child = root.spawn_child();
        child.step = PaymentStep::Success;
        child.route = Some(Vec::new());
        child.result = Some(PaymentResult::complete(
            MilliSatoshi::from_msat(100_050),
            Preimage::from_bytes([1; 32]),
        ));

        let collected = collect(&root).unwrap();

        assert_eq!(collected.sent, MilliSatoshi::from_msat(100_050));
        assert_eq!(collected.preimage, Some(Preimage::from_bytes([1; 32])));
        assert_eq!(collected.attempts, 2);
        assert_eq!(
            collected.leafstates,
            PaymentStep::Success.bit()
        );
        assert_eq!(
            collected.treestates,
            PaymentStep::Success.bit() | PaymentStep::Retry.bit()
        );
    }

    #[test]
    fn collect_detects_amount_overflow() {
        let mut root = Payment::new_root(test_params());
        root.step = PaymentStep::Split;

        for _ in 0..2 {
            let child = root.spawn_child();
            child.step = PaymentStep::Success;
            child.result = Some(PaymentResult::complete(
                MilliSatoshi::from_msat(u64::max_value()),
                Preimage::from_bytes([1; 32]),
            ));
        }

        assert!(collect(&root).is_err());
    }

    #[test]
    fn highest_failcode_wins_first_seen_breaks_ties() {
        let mut root = Payment::new_root(test_params());
        root.step = PaymentStep::Retry;

        let temp = PaymentResult {
            failcode: Some(FailCode::TemporaryChannelFailure),
            message: "first temporary".to_string(),
            ..PaymentResult::local_failure(String::new())
        };

        let first = root.spawn_child();
        first.step = PaymentStep::Failed;
        first.result = Some(temp.clone());

        let second = root.spawn_child();
        second.step = PaymentStep::Failed;
        second.result = Some(PaymentResult {
            failcode: Some(FailCode::PermanentChannelFailure),
            message: "permanent".to_string(),
            ..PaymentResult::local_failure(String::new())
        });

        let third = root.spawn_child();
        third.step = PaymentStep::Failed;
        third.result = Some(PaymentResult {
            message: "second temporary".to_string(),
            ..temp
        });

        let collected = collect(&root).unwrap();
        let failure = collected.failure.unwrap();
        assert_eq!(failure.failcode, Some(FailCode::PermanentChannelFailure));
    }
}
