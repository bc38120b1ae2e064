use crate::{
    failure::classify_failure,
    onion::build_onion_request,
    payment::{
        modifiers::{default_modifiers, Modifier},
        root_outcome, Payment, PaymentContext, PaymentOutcome, PaymentParameters, PaymentStatus,
        PaymentStep, SendOnionRequest,
    },
    route::route_fee,
};
use anyhow::Result;
use futures::future::{join_all, FutureExt, LocalBoxFuture};
use log::debug;
use std::{any::Any, mem, time::SystemTime};

/// Drives payment trees to completion against a set of collaborators.
///
/// The driver advances each payment through its lifecycle, invoking every
/// modifier's step callback between consecutive states. Children spawned
/// by modifiers (retries, splits) re-enter the same machinery and run
/// concurrently with their siblings; everything stays on one logical task.
pub struct PaymentDriver<'a, C> {
    ctx: &'a C,
    modifiers: Vec<Box<dyn Modifier<C>>>,
}

impl<'a, C> std::fmt::Debug for PaymentDriver<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentDriver")
            .field(
                "modifiers",
                &self
                    .modifiers
                    .iter()
                    .map(|modifier| modifier.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<'a, C: PaymentContext> PaymentDriver<'a, C> {
    /// A driver with the standard modifier registry: local channel hints,
    /// routehints and retry.
    pub fn new(ctx: &'a C) -> Self {
        Self::with_modifiers(ctx, default_modifiers())
    }

    /// A driver with a caller-supplied modifier list. Every payment tree
    /// driven by it runs the same list; per-payment state lives in the
    /// slot each modifier's `init` returns.
    pub fn with_modifiers(ctx: &'a C, modifiers: Vec<Box<dyn Modifier<C>>>) -> Self {
        Self { ctx, modifiers }
    }

    pub fn modifiers(&self) -> &[Box<dyn Modifier<C>>] {
        &self.modifiers
    }

    /// Builds the root payment for `params`, with its modifier slots
    /// initialized.
    pub fn new_payment(&self, params: PaymentParameters) -> Payment {
        let mut root = Payment::new_root(params);
        self.init_modifier_data(&mut root, None);
        root
    }

    /// Sends a payment and surfaces the single outcome for it.
    pub async fn send(&self, params: PaymentParameters) -> Result<PaymentOutcome> {
        let mut root = self.new_payment(params);
        self.run(&mut root).await
    }

    /// Drives `root`'s whole tree until every leaf is terminal, then
    /// aggregates the outcome. The tree is left in place for inspection.
    pub async fn run(&self, root: &mut Payment) -> Result<PaymentOutcome> {
        self.drive(root).await;
        root_outcome(root)
    }

    fn init_modifier_data(&self, payment: &mut Payment, parent_data: Option<&[Box<dyn Any>]>) {
        debug_assert!(payment.modifier_data.is_empty());
        for (index, modifier) in self.modifiers.iter().enumerate() {
            let parent_slot = parent_data.map(|slots| &*slots[index]);
            let slot = modifier.init(payment, parent_slot);
            payment.modifier_data.push(slot);
        }
    }

    /// Runs one payment node to a terminal step, then its children. Boxed
    /// so subtrees can recurse without unbounded stack growth per state.
    fn drive<'s>(&'s self, payment: &'s mut Payment) -> LocalBoxFuture<'s, ()> {
        async move {
            debug!(
                "payment {} part {}: {} to {}",
                payment.id, payment.partid, payment.amount, payment.destination
            );

            match self.ctx.block_height().await {
                Ok(height) => payment.start_block = height,
                Err(e) => payment.fail_local(format!("getinfo failed: {:#}", e)),
            }

            loop {
                self.run_modifier_pipeline(payment).await;

                match payment.step {
                    PaymentStep::Initialized => self.acquire_route(payment).await,
                    PaymentStep::GotRoute => self.build_onion_payloads(payment),
                    PaymentStep::OnionPayload => self.send_and_await(payment).await,
                    PaymentStep::Success | PaymentStep::Failed => {
                        payment.end_time = Some(SystemTime::now());
                        break;
                    }
                    PaymentStep::Retry | PaymentStep::Split => {
                        payment.end_time = Some(SystemTime::now());
                        self.drive_children(payment).await;
                        break;
                    }
                }
            }
        }
        .boxed_local()
    }

    /// Invokes every modifier's step callback once, in registry order.
    /// A failing modifier fails the payment but the chain still finishes,
    /// so later modifiers (like retry) observe the failure.
    async fn run_modifier_pipeline(&self, payment: &mut Payment) {
        loop {
            let next = payment.current_modifier.map_or(0, |index| index + 1);
            if next >= self.modifiers.len() {
                payment.current_modifier = None;
                return;
            }
            payment.current_modifier = Some(next);

            let modifier = &self.modifiers[next];
            let mut slot = mem::replace(&mut payment.modifier_data[next], Box::new(()));
            if let Err(e) = modifier.step(&mut *slot, payment, self.ctx).await {
                if !payment.step.is_final() && !payment.step.is_branch() {
                    payment.fail_local(format!("modifier {} failed: {:#}", modifier.name(), e));
                }
            }
            payment.modifier_data[next] = slot;
        }
    }

    async fn acquire_route(&self, payment: &mut Payment) {
        let exclude = payment.shared().exclusions(payment.amount);
        let request = payment.getroute.request(exclude);
        debug!(
            "payment {} part {}: getroute {} to {} (cltv {}, {} exclusions)",
            payment.id,
            payment.partid,
            request.amount,
            request.destination,
            request.cltv,
            request.exclude.len()
        );

        let route = match self.ctx.get_route(request).await {
            Ok(route) => route,
            Err(e) => {
                payment.fail_local(format!("no route found: {:#}", e));
                return;
            }
        };
        if route.is_empty() {
            payment.fail_local("routing service returned an empty route".to_string());
            return;
        }

        let fee = route_fee(payment.amount, &route);
        let first_delay = route[0].delay;
        payment.route = Some(route);

        // Both budgets are enforced before anything is sent; the route
        // stays recorded so the retry policy can tell this attempt got one.
        let fee = match fee {
            Some(fee) => fee,
            None => {
                payment.fail_local("route delivers less than the payment amount".to_string());
                return;
            }
        };
        if fee > payment.fee_budget {
            payment.fail_local(format!(
                "Fee exceeds our fee budget: {} > {}, discarding route",
                fee, payment.fee_budget
            ));
            return;
        }
        if first_delay > payment.cltv_budget {
            payment.fail_local(format!(
                "CLTV delay exceeds our CLTV budget: {} > {}, discarding route",
                first_delay, payment.cltv_budget
            ));
            return;
        }

        payment.step = PaymentStep::GotRoute;
    }

    fn build_onion_payloads(&self, payment: &mut Payment) {
        payment.createonion = Some(build_onion_request(
            payment.route.as_ref().expect("route set before GOT_ROUTE"),
            payment.start_block,
            payment.payment_hash,
            payment.payment_secret.as_ref(),
            payment.total_msat,
        ));
        payment.step = PaymentStep::OnionPayload;
    }

    async fn send_and_await(&self, payment: &mut Payment) {
        let request = payment
            .createonion
            .take()
            .expect("onion payloads built before ONION_PAYLOAD");

        let created = match self.ctx.create_onion(request).await {
            Ok(created) => created,
            Err(e) => {
                payment.fail_local(format!("createonion failed: {:#}", e));
                return;
            }
        };

        let first_hop = payment.route.as_ref().expect("route set before sending")[0].clone();
        debug!(
            "payment {} part {}: sending {} through {}",
            payment.id, payment.partid, first_hop.amount, first_hop.scid
        );

        let send = SendOnionRequest {
            onion: created.onion,
            first_hop,
            payment_hash: payment.payment_hash,
            shared_secrets: created.shared_secrets,
            partid: payment.partid,
        };
        if let Err(e) = self.ctx.send_onion(send).await {
            payment.fail_local(format!("sendonion failed: {:#}", e));
            return;
        }

        match self
            .ctx
            .wait_send_pay(payment.payment_hash, payment.partid)
            .await
        {
            Ok(result) => {
                if result.state == PaymentStatus::Complete {
                    debug!(
                        "payment {} part {}: complete, sent {}",
                        payment.id, payment.partid, result.amount_sent
                    );
                    payment.result = Some(result);
                    payment.step = PaymentStep::Success;
                } else {
                    debug!(
                        "payment {} part {}: failed with {} at index {:?}",
                        payment.id,
                        payment.partid,
                        result
                            .failcodename()
                            .unwrap_or("no failcode"),
                        result.erring_index
                    );
                    {
                        let mut shared = payment.shared_mut();
                        let route = payment.route.as_deref().unwrap_or(&[]);
                        classify_failure(&mut shared, route, &result);
                    }
                    payment.result = Some(result);
                    payment.step = PaymentStep::Failed;
                }
            }
            Err(e) => payment.fail_local(format!("waitsendpay failed: {:#}", e)),
        }
    }

    /// Initializes freshly spawned children from the parent's modifier
    /// slots and drives them concurrently. Each child handles its own
    /// descendants, so one pass suffices.
    async fn drive_children(&self, payment: &mut Payment) {
        let Payment {
            ref mut children,
            ref modifier_data,
            ..
        } = *payment;

        for child in children.iter_mut() {
            if child.modifier_data.is_empty() {
                self.init_modifier_data(child, Some(modifier_data.as_slice()));
            }
        }

        join_all(children.iter_mut().map(|child| self.drive(child))).await;
    }
}
