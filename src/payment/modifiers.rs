use crate::{
    amount::MilliSatoshi,
    failure::payment_can_retry,
    payment::{ListPeerChannels, Payment, PaymentContext, PaymentStep, SharedState},
    route::{channel_direction, HopStyle, RouteHint, RouteHop, ROUTING_MAX_HOPS},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use log::debug;
use std::any::Any;

/// A pluggable interceptor of payment state transitions.
///
/// `init` is invoked once per payment at construction time and returns the
/// modifier's private data slot for that payment; `step` runs between
/// every pair of consecutive states and may rewrite the payment, mutate
/// the shared root state or spawn children. The modifier list is identical
/// across a payment tree, so a parent's slot at the same index belongs to
/// the same modifier.
#[async_trait(?Send)]
pub trait Modifier<C> {
    fn name(&self) -> &'static str;

    fn init(&self, payment: &Payment, parent_data: Option<&dyn Any>) -> Box<dyn Any>;

    async fn step(&self, data: &mut dyn Any, payment: &mut Payment, ctx: &C) -> Result<()>;
}

/// The standard registry: seed hints from local topology, apply invoice
/// routehints, retry failures.
pub fn default_modifiers<C: PaymentContext>() -> Vec<Box<dyn Modifier<C>>> {
    vec![
        Box::new(LocalChannelHints),
        Box::new(RouteHints),
        Box::new(Retry),
    ]
}

/// Looks up the data slot a named modifier owns on `payment`.
pub fn modifier_data<'p, T: 'static, C>(
    payment: &'p Payment,
    modifiers: &[Box<dyn Modifier<C>>],
    name: &str,
) -> Option<&'p T> {
    let index = modifiers.iter().position(|modifier| modifier.name() == name)?;
    payment.modifier_data.get(index)?.downcast_ref()
}

const DEFAULT_RETRIES: u32 = 10;

/// Spawns a replacement attempt when a payment fails retryably. The root
/// starts with a budget of [`DEFAULT_RETRIES`]; every generation inherits
/// one less.
#[derive(Debug)]
pub struct Retry;

#[derive(Clone, Debug)]
pub struct RetryData {
    pub retries_left: u32,
}

#[async_trait(?Send)]
impl<C> Modifier<C> for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn init(&self, _payment: &Payment, parent_data: Option<&dyn Any>) -> Box<dyn Any> {
        let retries_left = parent_data
            .and_then(|data| data.downcast_ref::<RetryData>())
            .map(|parent| parent.retries_left.saturating_sub(1))
            .unwrap_or(DEFAULT_RETRIES);

        Box::new(RetryData { retries_left })
    }

    async fn step(&self, data: &mut dyn Any, payment: &mut Payment, _ctx: &C) -> Result<()> {
        if payment.step != PaymentStep::Failed {
            return Ok(());
        }

        let data = data
            .downcast_ref::<RetryData>()
            .expect("retry slot holds RetryData");

        // Only payments that actually got a route are worth retrying, and
        // only while the root has not given up on the destination.
        if payment.route.is_none()
            || payment.aborted()
            || data.retries_left == 0
            || !payment_can_retry(payment.result.as_ref())
        {
            return Ok(());
        }

        debug!(
            "payment {} part {}: retrying ({} retries left)",
            payment.id, payment.partid, data.retries_left
        );
        payment.spawn_child();
        payment.step = PaymentStep::Retry;
        Ok(())
    }
}

/// Routes payments into invoice routehints: picks a usable hint, routes to
/// its entry node and stitches the hint hops onto the returned route.
#[derive(Debug)]
pub struct RouteHints;

#[derive(Clone, Debug, Default)]
pub struct RouteHintsData {
    pub hints: Vec<RouteHint>,
    pub current: Option<RouteHint>,
}

#[async_trait(?Send)]
impl<C> Modifier<C> for RouteHints {
    fn name(&self) -> &'static str {
        "routehints"
    }

    fn init(&self, _payment: &Payment, parent_data: Option<&dyn Any>) -> Box<dyn Any> {
        let data = parent_data
            .and_then(|data| data.downcast_ref::<RouteHintsData>())
            .map(|parent| RouteHintsData {
                hints: parent.hints.clone(),
                current: None,
            })
            .unwrap_or_default();

        Box::new(data)
    }

    async fn step(&self, data: &mut dyn Any, payment: &mut Payment, _ctx: &C) -> Result<()> {
        let data = data
            .downcast_mut::<RouteHintsData>()
            .expect("routehints slot holds RouteHintsData");

        match payment.step {
            PaymentStep::Initialized => {
                if payment.is_root() {
                    let local_id = payment.shared().local_id;
                    data.hints = filter_route_hints(&local_id, payment.route_hints.clone());
                }

                data.current = {
                    let shared = payment.shared();
                    data.hints
                        .iter()
                        .find(|hint| !hint_excluded(&shared, payment.amount, hint))
                        .cloned()
                };

                if let Some(hint) = &data.current {
                    // Route to the hint's entry node instead, carrying
                    // enough to pay the hint's fees and delays on top.
                    payment.getroute.destination =
                        hint.first().expect("filtered hints are non-empty").node_id;
                    for hop in hint {
                        payment.getroute.amount = payment
                            .getroute
                            .amount
                            .checked_add_fee(hop.fee_base_msat, hop.fee_proportional_millionths)
                            .ok_or_else(|| anyhow!("routehint fees overflow"))?;
                        payment.getroute.cltv += hop.cltv_expiry_delta as u32;
                    }
                    debug!(
                        "payment {} part {}: using routehint via {}",
                        payment.id, payment.partid, payment.getroute.destination
                    );
                }
            }
            PaymentStep::GotRoute => {
                if let Some(hint) = data.current.clone() {
                    stitch_route_hint(payment, &hint)?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Trims hints to half the route length budget, strips prefixes through
/// ourselves and drops hints with nothing left.
fn filter_route_hints(local_id: &PublicKey, hints: Vec<RouteHint>) -> Vec<RouteHint> {
    hints
        .into_iter()
        .filter_map(|mut hint| {
            hint.truncate((ROUTING_MAX_HOPS / 2) as usize);
            while hint.first().map_or(false, |hop| hop.node_id == *local_id) {
                hint.remove(0);
            }
            if hint.is_empty() {
                None
            } else {
                Some(hint)
            }
        })
        .collect()
}

fn hint_excluded(shared: &SharedState, amount: MilliSatoshi, hint: &RouteHint) -> bool {
    hint.iter().any(|hop| {
        shared.excluded_nodes.contains(&hop.node_id)
            || shared.channel_hints.iter().any(|channel| {
                channel.scid == hop.scid
                    && (!channel.enabled || amount >= channel.estimated_capacity)
            })
    })
}

/// Appends the hint's hops to the route ending at its entry node,
/// computing every forward amount and outgoing delay backwards from the
/// delivered amount.
fn stitch_route_hint(payment: &mut Payment, hint: &RouteHint) -> Result<()> {
    let mut route = match payment.route.take() {
        Some(route) => route,
        None => return Ok(()),
    };
    let style = route
        .last()
        .map(|hop| hop.style)
        .unwrap_or(HopStyle::Tlv);

    let mut amount = payment.amount;
    let mut delay = payment.min_final_cltv_expiry;
    let mut stitched: Vec<RouteHop> = Vec::with_capacity(hint.len());

    for (index, hop) in hint.iter().enumerate().rev() {
        let next_node = hint
            .get(index + 1)
            .map(|next| next.node_id)
            .unwrap_or(payment.destination);

        stitched.push(RouteHop {
            node_id: next_node,
            scid: hop.scid,
            direction: channel_direction(&hop.node_id, &next_node),
            amount,
            delay,
            style,
        });

        amount = amount
            .checked_add_fee(hop.fee_base_msat, hop.fee_proportional_millionths)
            .ok_or_else(|| anyhow!("routehint fees overflow"))?;
        delay += hop.cltv_expiry_delta as u32;
    }

    stitched.reverse();
    route.extend(stitched);
    payment.route = Some(route);
    Ok(())
}

/// Seeds the root's channel hints from our own channels: disconnected
/// peers are unusable and spendable amounts bound what fits through.
#[derive(Debug)]
pub struct LocalChannelHints;

#[async_trait(?Send)]
impl<C: ListPeerChannels> Modifier<C> for LocalChannelHints {
    fn name(&self) -> &'static str {
        "local_channel_hints"
    }

    fn init(&self, _payment: &Payment, _parent_data: Option<&dyn Any>) -> Box<dyn Any> {
        Box::new(())
    }

    async fn step(&self, _data: &mut dyn Any, payment: &mut Payment, ctx: &C) -> Result<()> {
        // Local knowledge does not change between attempts; seeding once
        // at the root is enough.
        if payment.step != PaymentStep::Initialized || !payment.is_root() {
            return Ok(());
        }

        let channels = ctx.list_peer_channels().await?;
        let mut shared = payment.shared_mut();
        let count = channels.len();
        for channel in channels {
            shared.update_channel_hint(
                channel.scid,
                channel.direction,
                channel.connected,
                channel.spendable_msat,
            );
        }
        debug!("seeded channel hints from {} local channels", count);

        Ok(())
    }
}
