//! Exit management
//!
//! Exit rules are evaluated in strict priority order (HARD_SL > HARD_TP >
//! TRAILING > TIME); triggered exits flow through a bounded, deduplicated
//! FIFO queue into the placement ladder. SELL exits start one tick under the
//! bid and escalate through configured bp premiums; ladder exhaustion falls
//! back to a market IOC unless market sells are forbidden, in which case the
//! exit is re-queued for the next cycle. Each position also carries a resting
//! take-profit protection order that is restored when missing.

use crate::core::order_fsm::OrderState;
use crate::core::types::{round_price_to_tick, OrderType, Side, Symbol, TimeInForce};
use crate::engine::orders::{FillDelta, OrderGateway, PlaceError};
use crate::engine::pnl::{FillEvent, PnlService};
use crate::engine::positions::{Position, PositionBook};
use crate::exchange::client::ExchangeClient;
use crate::persist::{Event, EventLog};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Exit rules
// ============================================================================

/// Exit reasons, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    HardSl,
    HardTp,
    Trailing,
    Time,
}

impl ExitReason {
    pub fn priority(&self) -> u8 {
        match self {
            ExitReason::HardSl => 0,
            ExitReason::HardTp => 1,
            ExitReason::Trailing => 2,
            ExitReason::Time => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::HardSl => "HARD_SL",
            ExitReason::HardTp => "HARD_TP",
            ExitReason::Trailing => "TRAILING",
            ExitReason::Time => "TIME",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitRules {
    /// Take-profit price factor on entry (e.g. 1.05)
    pub tp_factor: Option<Decimal>,
    /// Stop-loss price factor on entry (e.g. 0.95)
    pub sl_factor: Option<Decimal>,
    pub use_trailing: bool,
    /// Percent above entry the peak must reach before trailing arms
    pub trailing_activation_pct: Decimal,
    /// Percent below peak that fires the trailing stop
    pub trailing_distance_pct: Decimal,
    /// Time-to-live; None disables the TIME rule
    pub max_hold_minutes: Option<i64>,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            tp_factor: Some(Decimal::new(105, 2)),
            sl_factor: Some(Decimal::new(95, 2)),
            use_trailing: false,
            trailing_activation_pct: Decimal::ONE,
            trailing_distance_pct: Decimal::from(2),
            max_hold_minutes: Some(60),
        }
    }
}

impl ExitRules {
    pub fn tp_price(&self, entry: Decimal) -> Option<Decimal> {
        self.tp_factor.map(|f| entry * f)
    }

    pub fn sl_price(&self, entry: Decimal) -> Option<Decimal> {
        self.sl_factor.map(|f| entry * f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub trigger_price: Option<Decimal>,
}

/// Highest-priority triggered rule, or None.
pub fn evaluate_exit(
    position: &Position,
    rules: &ExitRules,
    price: Decimal,
    now_s: i64,
) -> Option<ExitDecision> {
    if let Some(sl) = rules.sl_price(position.entry_price) {
        if price <= sl {
            return Some(ExitDecision {
                reason: ExitReason::HardSl,
                trigger_price: Some(sl),
            });
        }
    }
    if let Some(tp) = rules.tp_price(position.entry_price) {
        if price >= tp {
            return Some(ExitDecision {
                reason: ExitReason::HardTp,
                trigger_price: Some(tp),
            });
        }
    }
    if rules.use_trailing && position.enable_trailing {
        let hundred = Decimal::from(100);
        let activation =
            position.entry_price * (Decimal::ONE + rules.trailing_activation_pct / hundred);
        if position.peak_price_since_entry >= activation {
            let trigger = position.peak_price_since_entry
                * (Decimal::ONE - rules.trailing_distance_pct / hundred);
            if price <= trigger {
                return Some(ExitDecision {
                    reason: ExitReason::Trailing,
                    trigger_price: Some(trigger),
                });
            }
        }
    }
    if let Some(minutes) = rules.max_hold_minutes {
        if position.held_for_s(now_s) >= minutes * 60 {
            return Some(ExitDecision {
                reason: ExitReason::Time,
                trigger_price: None,
            });
        }
    }
    None
}

// ============================================================================
// Exit-signal queue
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub symbol: Symbol,
    pub reason: ExitReason,
    pub position: Position,
    pub current_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    Duplicate,
    Full,
}

/// Bounded FIFO with per-symbol duplicate suppression inside a short TTL.
pub struct ExitQueue {
    queue: VecDeque<ExitSignal>,
    capacity: usize,
    dedup_ttl: Duration,
    last_enqueued: HashMap<Symbol, Instant>,
}

impl ExitQueue {
    pub fn new(capacity: usize, dedup_ttl: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dedup_ttl,
            last_enqueued: HashMap::new(),
        }
    }

    pub fn push(&mut self, signal: ExitSignal) -> EnqueueResult {
        if let Some(last) = self.last_enqueued.get(&signal.symbol) {
            if last.elapsed() < self.dedup_ttl {
                return EnqueueResult::Duplicate;
            }
        }
        if self.queue.len() >= self.capacity {
            warn!(symbol = %signal.symbol, "exit queue full, signal dropped");
            return EnqueueResult::Full;
        }
        self.last_enqueued
            .insert(signal.symbol.clone(), Instant::now());
        self.queue.push_back(signal);
        EnqueueResult::Queued
    }

    /// Re-insert without duplicate suppression (ladder exhaustion path).
    pub fn requeue(&mut self, signal: ExitSignal) {
        if self.queue.len() >= self.capacity {
            warn!(symbol = %signal.symbol, "exit queue full on requeue");
            return;
        }
        self.queue.push_back(signal);
    }

    pub fn drain(&mut self, max: usize) -> Vec<ExitSignal> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ============================================================================
// Exit manager
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExitConfig {
    pub rules: ExitRules,
    /// Ladder premiums in bps below the bid, tried in order after the
    /// initial `bid - tick` step
    pub ladder_bps: Vec<i64>,
    /// Seconds a ladder step may rest unfilled before escalation
    pub step_ttl_s: i64,
    /// Forbid market IOC on ladder exhaustion; re-queue instead
    pub never_market_sells: bool,
    pub queue_capacity: usize,
    pub dedup_ttl: Duration,
    /// Max signals drained per processing pass
    pub max_batch: usize,
    /// Reattach tolerance for crash-recovered protection orders
    pub reattach_tolerance_pct: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            rules: ExitRules::default(),
            ladder_bps: vec![50, 100, 200, 500],
            step_ttl_s: 10,
            never_market_sells: false,
            queue_capacity: 64,
            dedup_ttl: Duration::from_secs(2),
            max_batch: 5,
            reattach_tolerance_pct: Decimal::from(2),
        }
    }
}

/// A settled (fully or partially filled) exit.
#[derive(Debug, Clone)]
pub struct ExitFill {
    pub symbol: Symbol,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub reason: ExitReason,
    /// True when the position is fully closed
    pub position_closed: bool,
}

#[derive(Debug, Clone)]
struct ExitExecution {
    order_id: String,
    /// 0 = `bid - tick`; 1..=ladder_bps.len() index premiums; beyond = market
    ladder_step: usize,
    reason: ExitReason,
    placed_at_s: i64,
    market_stage: bool,
}

pub struct ExitManager {
    config: ExitConfig,
    queue: ExitQueue,
    executions: HashMap<Symbol, ExitExecution>,
}

impl ExitManager {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            queue: ExitQueue::new(config.queue_capacity, config.dedup_ttl),
            executions: HashMap::new(),
            config,
        }
    }

    pub fn rules(&self) -> &ExitRules {
        &self.config.rules
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_execution(&self, symbol: &Symbol) -> bool {
        self.executions.contains_key(symbol)
    }

    /// Evaluate rules for one position and enqueue the decision.
    ///
    /// HARD_TP is not enqueued while a protection order rests at the venue;
    /// the resting order realizes it without taker fees.
    pub fn evaluate_and_enqueue(
        &mut self,
        position: &Position,
        price: Decimal,
        now_s: i64,
    ) -> Option<ExitDecision> {
        if self.has_execution(&position.symbol) {
            return None;
        }
        let decision = evaluate_exit(position, &self.config.rules, price, now_s)?;
        if decision.reason == ExitReason::HardTp && position.active_exit_order_id.is_some() {
            return Some(decision);
        }
        let signal = ExitSignal {
            symbol: position.symbol.clone(),
            reason: decision.reason,
            position: position.clone(),
            current_price: price,
        };
        match self.queue.push(signal) {
            EnqueueResult::Queued => {
                info!(
                    symbol = %position.symbol,
                    reason = decision.reason.as_str(),
                    %price,
                    "exit signal queued"
                );
            }
            EnqueueResult::Duplicate => {
                debug!(symbol = %position.symbol, "exit signal deduplicated");
            }
            EnqueueResult::Full => {}
        }
        Some(decision)
    }

    /// Maintain the resting take-profit protection for a position: reconcile
    /// a tracked order, reattach a matching open order after a crash, or
    /// place a fresh one. Returns a settlement when the protection filled.
    pub fn ensure_protection<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        symbol: &Symbol,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        if self.has_execution(symbol) {
            return None;
        }
        let position = book.get(symbol)?.clone();

        if let Some(order_id) = &position.active_exit_order_id {
            match gateway.sync_order(order_id, symbol) {
                Ok((fsm, delta)) => {
                    let fill = delta.map(|d| {
                        self.settle_fill(book, symbol, d, ExitReason::HardTp, pnl, events, now_s)
                    });
                    match fsm.state {
                        OrderState::Filled | OrderState::Canceled | OrderState::Expired
                        | OrderState::Failed => {
                            if let Some(p) = book.get_mut(symbol) {
                                p.active_exit_order_id = None;
                            }
                        }
                        // Still resting; a partial fill may have settled
                        _ => return fill,
                    }
                    return fill;
                }
                Err(e) => {
                    debug!(%symbol, kind = e.kind(), "protection sync failed");
                    // Not found at the venue: fall through to restore
                    if let Some(p) = book.get_mut(symbol) {
                        p.active_exit_order_id = None;
                    }
                }
            }
        }

        // Restore-on-missing: adopt any open order near TP or SL
        let tp = self.config.rules.tp_price(position.entry_price);
        let sl = self.config.rules.sl_price(position.entry_price);
        if let Ok(open_orders) = gateway.open_orders(symbol) {
            let tolerance = self.config.reattach_tolerance_pct / Decimal::from(100);
            for order in &open_orders {
                if order.side != Side::Sell {
                    continue;
                }
                let Some(px) = order.price else { continue };
                let near = |target: Option<Decimal>| {
                    target
                        .map(|t| t > Decimal::ZERO && ((px - t) / t).abs() <= tolerance)
                        .unwrap_or(false)
                };
                if near(tp) || near(sl) {
                    info!(%symbol, order_id = %order.order_id, "protection order reattached");
                    if let Some(p) = book.get_mut(symbol) {
                        p.active_exit_order_id = Some(order.order_id.clone());
                    }
                    return None;
                }
            }
        }

        // Place a fresh protection order at TP
        if let Some(tp_px) = tp {
            match gateway.place_order(
                symbol,
                Side::Sell,
                OrderType::Limit,
                position.quantity,
                Some(tp_px),
                TimeInForce::Gtc,
                false,
            ) {
                Ok(fsm) => {
                    info!(%symbol, order_id = %fsm.order_id, price = %tp_px, "protection order placed");
                    // A marketable protection price can fill at placement
                    let settled = (fsm.filled_qty > Decimal::ZERO).then(|| {
                        self.settle_fill(
                            book,
                            symbol,
                            FillDelta {
                                qty: fsm.filled_qty,
                                price: fsm.avg_fill_price,
                                fee: fsm.total_fees,
                            },
                            ExitReason::HardTp,
                            pnl,
                            events,
                            now_s,
                        )
                    });
                    if !fsm.is_terminal() {
                        if let Some(p) = book.get_mut(symbol) {
                            p.active_exit_order_id = Some(fsm.order_id.clone());
                        }
                    }
                    return settled;
                }
                Err(e) => warn!(%symbol, error = %e, "protection placement failed"),
            }
        }
        None
    }

    /// Escalate in-flight exits and start executions for drained signals.
    pub fn process<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Vec<ExitFill> {
        let mut fills = Vec::new();

        // Snapshot the batch first: signals re-queued while polling (ladder
        // exhaustion with market sells disabled) wait for the next pass
        let drained = self.queue.drain(self.config.max_batch);

        // 1. Poll active executions
        let symbols: Vec<Symbol> = self.executions.keys().cloned().collect();
        for symbol in symbols {
            if let Some(fill) = self.poll_execution(gateway, book, &symbol, pnl, events, now_s) {
                fills.push(fill);
            }
        }

        // 2. Start executions for the drained signals
        for signal in drained {
            if self.has_execution(&signal.symbol) || !book.contains(&signal.symbol) {
                continue;
            }
            if let Some(fill) = self.start_execution(gateway, book, &signal, pnl, events, now_s) {
                fills.push(fill);
            }
        }
        fills
    }

    fn ladder_price(&self, bid: Decimal, tick: Decimal, step: usize) -> Option<Decimal> {
        if step == 0 {
            let tick = if tick > Decimal::ZERO {
                tick
            } else {
                bid / Decimal::from(10_000)
            };
            return Some(bid - tick);
        }
        let premium = *self.config.ladder_bps.get(step - 1)?;
        Some(bid * (Decimal::ONE - Decimal::from(premium) / Decimal::from(10_000)))
    }

    fn start_execution<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        signal: &ExitSignal,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        let symbol = &signal.symbol;

        // An exit supersedes the resting protection order
        let protection = book.get(symbol).and_then(|p| p.active_exit_order_id.clone());
        if let Some(order_id) = protection {
            match gateway.cancel_order(&order_id, symbol) {
                Ok((_, Some(delta))) => {
                    // The protection filled while we were canceling it
                    let settled =
                        self.settle_fill(book, symbol, delta, signal.reason, pnl, events, now_s);
                    if settled.position_closed {
                        return Some(settled);
                    }
                }
                Ok((_, None)) => {}
                Err(e) => {
                    warn!(%symbol, error = %e, "protection cancel failed, deferring exit");
                    self.queue.requeue(signal.clone());
                    return None;
                }
            }
            if let Some(p) = book.get_mut(symbol) {
                p.active_exit_order_id = None;
            }
        }

        // The ladder anchors on the live bid; the signal price is the
        // fallback when the ticker is unavailable.
        let bid = gateway.ticker_bid(symbol).unwrap_or(signal.current_price);
        self.place_step(gateway, book, symbol, signal.reason, bid, 0, pnl, events, now_s)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_step<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        symbol: &Symbol,
        reason: ExitReason,
        reference_bid: Decimal,
        step: usize,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        let position = book.get(symbol)?;
        let qty = position.quantity;
        if qty <= Decimal::ZERO {
            book.remove(symbol);
            return None;
        }
        let market = gateway.market(symbol);

        match self.ladder_price(reference_bid, market.price_tick, step) {
            Some(raw_price) => {
                let price = round_price_to_tick(raw_price, market.price_tick);
                match gateway.place_order(
                    symbol,
                    Side::Sell,
                    OrderType::Limit,
                    qty,
                    Some(price),
                    TimeInForce::Gtc,
                    false,
                ) {
                    Ok(fsm) => {
                        info!(%symbol, step, %price, reason = reason.as_str(), "exit ladder step placed");
                        self.track_placed(book, symbol, fsm, reason, step, false, pnl, events, now_s)
                    }
                    Err(PlaceError::Sizing(e)) => {
                        warn!(%symbol, reason = e.reason(), "exit sizing rejected");
                        self.executions.remove(symbol);
                        None
                    }
                    Err(e) => {
                        warn!(%symbol, error = %e, "exit step placement failed");
                        self.executions.remove(symbol);
                        None
                    }
                }
            }
            None => {
                self.exhaust_ladder(gateway, book, symbol, reason, reference_bid, pnl, events, now_s)
            }
        }
    }

    /// Register a freshly placed exit order, settling any fills the venue
    /// reported at placement time.
    #[allow(clippy::too_many_arguments)]
    fn track_placed(
        &mut self,
        book: &mut PositionBook,
        symbol: &Symbol,
        fsm: crate::core::order_fsm::OrderFsm,
        reason: ExitReason,
        step: usize,
        market_stage: bool,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        let settled = (fsm.filled_qty > Decimal::ZERO).then(|| {
            self.settle_fill(
                book,
                symbol,
                FillDelta {
                    qty: fsm.filled_qty,
                    price: fsm.avg_fill_price,
                    fee: fsm.total_fees,
                },
                reason,
                pnl,
                events,
                now_s,
            )
        });

        if fsm.is_terminal() {
            self.executions.remove(symbol);
            if let Some(p) = book.get_mut(symbol) {
                p.active_exit_order_id = None;
            }
        } else {
            if let Some(p) = book.get_mut(symbol) {
                p.active_exit_order_id = Some(fsm.order_id.clone());
            }
            self.executions.insert(
                symbol.clone(),
                ExitExecution {
                    order_id: fsm.order_id,
                    ladder_step: step,
                    reason,
                    placed_at_s: now_s,
                    market_stage,
                },
            );
        }
        settled
    }

    #[allow(clippy::too_many_arguments)]
    fn exhaust_ladder<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        symbol: &Symbol,
        reason: ExitReason,
        reference_bid: Decimal,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        self.executions.remove(symbol);
        let position = book.get(symbol)?;

        if self.config.never_market_sells {
            // Market orders are forbidden: the evaluator re-queues on the
            // next cycle
            info!(%symbol, "ladder exhausted, market sells disabled, re-queueing");
            self.queue.requeue(ExitSignal {
                symbol: symbol.clone(),
                reason,
                position: position.clone(),
                current_price: reference_bid,
            });
            return None;
        }

        match gateway.place_order(
            symbol,
            Side::Sell,
            OrderType::Market,
            position.quantity,
            None,
            TimeInForce::Ioc,
            false,
        ) {
            Ok(fsm) => {
                warn!(%symbol, reason = reason.as_str(), "ladder exhausted, market IOC sent");
                let step = self.config.ladder_bps.len() + 1;
                self.track_placed(book, symbol, fsm, reason, step, true, pnl, events, now_s)
            }
            Err(e) => {
                warn!(%symbol, error = %e, "market exit failed");
                None
            }
        }
    }

    fn poll_execution<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        symbol: &Symbol,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        let execution = self.executions.get(symbol)?.clone();
        let (fsm, delta) = match gateway.sync_order(&execution.order_id, symbol) {
            Ok(r) => r,
            Err(e) => {
                debug!(%symbol, kind = e.kind(), "exit order sync failed");
                return None;
            }
        };

        let fill = delta.map(|d| {
            self.settle_fill(book, symbol, d, execution.reason, pnl, events, now_s)
        });

        match fsm.state {
            OrderState::Filled => {
                self.executions.remove(symbol);
                if let Some(p) = book.get_mut(symbol) {
                    p.active_exit_order_id = None;
                }
            }
            OrderState::Canceled | OrderState::Expired | OrderState::Failed => {
                // Canceled or expired mid-ladder: escalate with the remainder
                self.executions.remove(symbol);
                if book.contains(symbol) {
                    let escalated =
                        self.escalate(gateway, book, symbol, &execution, pnl, events, now_s);
                    return escalated.or(fill);
                }
            }
            OrderState::Pending | OrderState::Partial => {
                if now_s - execution.placed_at_s >= self.config.step_ttl_s
                    && !execution.market_stage
                {
                    // Step rested too long: cancel (idempotent) and escalate
                    let cancel_settled = match gateway.cancel_order(&execution.order_id, symbol) {
                        Ok((_, Some(d))) => Some(self.settle_fill(
                            book,
                            symbol,
                            d,
                            execution.reason,
                            pnl,
                            events,
                            now_s,
                        )),
                        Ok((_, None)) => None,
                        Err(e) => {
                            warn!(%symbol, kind = e.kind(), "exit cancel failed");
                            None
                        }
                    };
                    self.executions.remove(symbol);
                    let escalated = if book.contains(symbol) {
                        self.escalate(gateway, book, symbol, &execution, pnl, events, now_s)
                    } else {
                        None
                    };
                    return cancel_settled.or(escalated).or(fill);
                }
            }
        }
        fill
    }

    fn escalate<X: ExchangeClient>(
        &mut self,
        gateway: &OrderGateway<X>,
        book: &mut PositionBook,
        symbol: &Symbol,
        prior: &ExitExecution,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> Option<ExitFill> {
        // Reference the live bid when possible so escalation tracks the
        // book; the prior step's limit price is the fallback reference.
        let bid = gateway.ticker_bid(symbol).or_else(|| {
            gateway
                .registry()
                .get(&prior.order_id)
                .and_then(|f| f.limit_price)
        });
        let Some(bid) = bid.filter(|b| *b > Decimal::ZERO) else {
            if let Some(position) = book.get(symbol) {
                self.queue.requeue(ExitSignal {
                    symbol: symbol.clone(),
                    reason: prior.reason,
                    position: position.clone(),
                    current_price: Decimal::ZERO,
                });
            }
            return None;
        };
        let next_step = prior.ladder_step + 1;
        if next_step > self.config.ladder_bps.len() {
            self.exhaust_ladder(gateway, book, symbol, prior.reason, bid, pnl, events, now_s)
        } else {
            self.place_step(
                gateway, book, symbol, prior.reason, bid, next_step, pnl, events, now_s,
            )
        }
    }

    #[cfg(test)]
    fn execution_step(&self, symbol: &Symbol) -> Option<usize> {
        self.executions.get(symbol).map(|e| e.ladder_step)
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_fill(
        &self,
        book: &mut PositionBook,
        symbol: &Symbol,
        delta: FillDelta,
        reason: ExitReason,
        pnl: &PnlService,
        events: &EventLog,
        now_s: i64,
    ) -> ExitFill {
        let entry_price = book.get(symbol).map(|p| p.entry_price);
        pnl.apply_fill(&FillEvent {
            symbol: symbol.clone(),
            side: Side::Sell,
            qty: delta.qty,
            avg_price: delta.price,
            fee_quote: delta.fee,
            ts: now_s,
            entry_price,
        });
        events.emit(Event::ExitFilled {
            symbol: symbol.clone(),
            fill_price: delta.price,
            fill_qty: delta.qty,
            reason: reason.as_str().to_string(),
        });

        let mut closed = false;
        if let Some(position) = book.get_mut(symbol) {
            position.quantity -= delta.qty;
            if position.quantity <= Decimal::ZERO {
                closed = true;
            }
        }
        if closed {
            book.remove(symbol);
            info!(%symbol, reason = reason.as_str(), "position closed");
        }
        ExitFill {
            symbol: symbol.clone(),
            qty: delta.qty,
            price: delta.price,
            fee: delta.fee,
            reason,
            position_closed: closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::order_fsm::FsmRegistry;
    use crate::core::types::MarketInfo;
    use crate::exchange::mock::{FillMode, MockExchange};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn position(entry: Decimal, peak: Decimal, trailing: bool) -> Position {
        let mut p = Position::open(
            Symbol::from("BTC/USDT"),
            dec!(1),
            entry,
            0,
            Decimal::ZERO,
            trailing,
            "drop_trigger",
        );
        p.peak_price_since_entry = peak;
        p
    }

    fn rules_all() -> ExitRules {
        ExitRules {
            tp_factor: Some(dec!(1.05)),
            sl_factor: Some(dec!(0.95)),
            use_trailing: true,
            trailing_activation_pct: dec!(1),
            trailing_distance_pct: dec!(2),
            max_hold_minutes: Some(0),
        }
    }

    // ========================================================================
    // Rule evaluation
    // ========================================================================

    #[test]
    fn test_priority_hard_sl_wins_when_all_trigger() {
        // entry 100, sl 95, tp 105, peak 110 => trailing trigger 107.8,
        // ttl 0 minutes => expired. At price 95 every rule fires; HARD_SL
        // has priority 0.
        let p = position(dec!(100), dec!(110), true);
        let decision = evaluate_exit(&p, &rules_all(), dec!(95), 3600).unwrap();
        assert_eq!(decision.reason, ExitReason::HardSl);
        assert_eq!(decision.trigger_price, Some(dec!(95.00)));
    }

    #[test]
    fn test_trailing_requires_activation() {
        let mut rules = rules_all();
        rules.sl_factor = None;
        rules.tp_factor = None;
        rules.max_hold_minutes = None;

        // Peak never reached entry * 1.01: trailing not armed
        let p = position(dec!(100), dec!(100.5), true);
        assert!(evaluate_exit(&p, &rules, dec!(98), 0).is_none());

        // Peak 110 arms it; trigger 107.8
        let p = position(dec!(100), dec!(110), true);
        let decision = evaluate_exit(&p, &rules, dec!(107), 0).unwrap();
        assert_eq!(decision.reason, ExitReason::Trailing);
        assert_eq!(decision.trigger_price, Some(dec!(107.80)));
        assert!(evaluate_exit(&p, &rules, dec!(108), 0).is_none());
    }

    #[test]
    fn test_time_exit_after_ttl() {
        let mut rules = rules_all();
        rules.sl_factor = None;
        rules.tp_factor = None;
        rules.use_trailing = false;
        rules.max_hold_minutes = Some(60);

        let p = position(dec!(100), dec!(100), false);
        assert!(evaluate_exit(&p, &rules, dec!(100), 3599).is_none());
        let decision = evaluate_exit(&p, &rules, dec!(100), 3600).unwrap();
        assert_eq!(decision.reason, ExitReason::Time);
    }

    // ========================================================================
    // Queue
    // ========================================================================

    fn signal(symbol: &str) -> ExitSignal {
        ExitSignal {
            symbol: Symbol::from(symbol),
            reason: ExitReason::HardSl,
            position: position(dec!(100), dec!(100), false),
            current_price: dec!(95),
        }
    }

    #[test]
    fn test_queue_dedup_within_ttl() {
        let mut q = ExitQueue::new(10, Duration::from_secs(2));
        assert_eq!(q.push(signal("A/USDT")), EnqueueResult::Queued);
        assert_eq!(q.push(signal("A/USDT")), EnqueueResult::Duplicate);
        assert_eq!(q.push(signal("B/USDT")), EnqueueResult::Queued);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_queue_capacity() {
        let mut q = ExitQueue::new(1, Duration::ZERO);
        assert_eq!(q.push(signal("A/USDT")), EnqueueResult::Queued);
        assert_eq!(q.push(signal("B/USDT")), EnqueueResult::Full);
    }

    #[test]
    fn test_queue_drains_fifo() {
        let mut q = ExitQueue::new(10, Duration::ZERO);
        q.push(signal("A/USDT"));
        q.push(signal("B/USDT"));
        q.push(signal("C/USDT"));
        let drained = q.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].symbol, Symbol::from("A/USDT"));
        assert_eq!(q.len(), 1);
    }

    // ========================================================================
    // Ladder execution
    // ========================================================================

    struct Harness {
        mock: Arc<MockExchange>,
        gateway: OrderGateway<MockExchange>,
        book: PositionBook,
        pnl: PnlService,
        events: EventLog,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let mock = Arc::new(MockExchange::new());
        let sym = Symbol::from("BTC/USDT");
        mock.set_market(
            &sym,
            MarketInfo {
                price_tick: dec!(0.1),
                quantity_step: dec!(0.001),
                min_quantity: dec!(0.001),
                min_notional: Decimal::ZERO,
            },
        );
        mock.set_ticker_prices(&sym, dec!(100), dec!(100), dec!(100.2));
        let gateway = OrderGateway::new(mock.clone(), Arc::new(FsmRegistry::new()));
        gateway.load_markets(false).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let events = EventLog::open(&dir.path().join("events.jsonl")).unwrap();
        let mut book = PositionBook::new();
        book.insert(position(dec!(100), dec!(100), false));

        // The PnL projection must know the entry before exits can realize
        let pnl = PnlService::new();
        pnl.apply_fill(&FillEvent {
            symbol: sym.clone(),
            side: crate::core::types::Side::Buy,
            qty: dec!(1),
            avg_price: dec!(100),
            fee_quote: Decimal::ZERO,
            ts: 0,
            entry_price: None,
        });
        Harness {
            mock,
            gateway,
            book,
            pnl,
            events,
            _dir: dir,
        }
    }

    fn manager(never_market: bool) -> ExitManager {
        ExitManager::new(ExitConfig {
            ladder_bps: vec![50, 100],
            step_ttl_s: 10,
            never_market_sells: never_market,
            dedup_ttl: Duration::ZERO,
            ..ExitConfig::default()
        })
    }

    #[test]
    fn test_ladder_starts_below_bid() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(false);
        let sym = Symbol::from("BTC/USDT");

        mgr.queue.push(signal("BTC/USDT"));
        mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, 0);

        assert_eq!(mgr.execution_step(&sym), Some(0));
        let order_id = h.book.get(&sym).unwrap().active_exit_order_id.clone().unwrap();
        let fsm = h.gateway.registry().get(&order_id).unwrap();
        // bid 100, tick 0.1 => 99.9
        assert_eq!(fsm.limit_price, Some(dec!(99.9)));
    }

    #[test]
    fn test_ladder_escalates_after_step_ttl() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(false);
        let sym = Symbol::from("BTC/USDT");

        mgr.queue.push(signal("BTC/USDT"));
        mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, 0);
        assert_eq!(mgr.execution_step(&sym), Some(0));

        // Past the step TTL the step is canceled and the ladder escalates
        mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, 11);
        assert_eq!(mgr.execution_step(&sym), Some(1));
        let order_id = h.book.get(&sym).unwrap().active_exit_order_id.clone().unwrap();
        let fsm = h.gateway.registry().get(&order_id).unwrap();
        // 50 bps under bid 100 => 99.5
        assert_eq!(fsm.limit_price, Some(dec!(99.5)));
    }

    #[test]
    fn test_exhaustion_requeues_when_market_sells_forbidden() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(true);
        let sym = Symbol::from("BTC/USDT");

        mgr.queue.push(signal("BTC/USDT"));
        let mut now = 0;
        mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, now);
        // Walk through every ladder step
        for _ in 0..3 {
            now += 11;
            mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, now);
        }
        // Ladder exhausted: no execution, no market order, signal re-queued
        assert!(!mgr.has_execution(&sym));
        assert!(mgr.queue_len() > 0);
        assert!(h.book.contains(&sym));
    }

    #[test]
    fn test_fill_settles_and_closes_position() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(false);
        let sym = Symbol::from("BTC/USDT");

        mgr.queue.push(signal("BTC/USDT"));
        mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, 0);
        let order_id = h.book.get(&sym).unwrap().active_exit_order_id.clone().unwrap();

        // Venue fills the ladder order fully at 99.9
        h.mock.fill_order(&order_id, dec!(1), dec!(99.9));
        let fills = mgr.process(&h.gateway, &mut h.book, &h.pnl, &h.events, 1);

        assert_eq!(fills.len(), 1);
        assert!(fills[0].position_closed);
        assert!(!h.book.contains(&sym));
        assert!(!mgr.has_execution(&sym));
        // Realized loss: 1 * (99.9 - 100) minus fees
        assert!(h.pnl.realized_net() < Decimal::ZERO);
    }

    #[test]
    fn test_protection_placed_and_reattached() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(false);
        let sym = Symbol::from("BTC/USDT");

        // First pass places a TP protection at entry * 1.05 = 105
        mgr.ensure_protection(&h.gateway, &mut h.book, &sym, &h.pnl, &h.events, 0);
        let order_id = h.book.get(&sym).unwrap().active_exit_order_id.clone().unwrap();
        let fsm = h.gateway.registry().get(&order_id).unwrap();
        assert_eq!(fsm.limit_price, Some(dec!(105.0)));

        // Simulate crash: the engine forgets the order id but it is still
        // open at the venue within the 2% reattach window
        h.book.get_mut(&sym).unwrap().active_exit_order_id = None;
        mgr.ensure_protection(&h.gateway, &mut h.book, &sym, &h.pnl, &h.events, 1);
        assert_eq!(
            h.book.get(&sym).unwrap().active_exit_order_id,
            Some(order_id)
        );
    }

    #[test]
    fn test_protection_fill_closes_position() {
        let mut h = harness();
        h.mock.set_fill_mode(FillMode::None);
        let mut mgr = manager(false);
        let sym = Symbol::from("BTC/USDT");

        mgr.ensure_protection(&h.gateway, &mut h.book, &sym, &h.pnl, &h.events, 0);
        let order_id = h.book.get(&sym).unwrap().active_exit_order_id.clone().unwrap();

        h.mock.fill_order(&order_id, dec!(1), dec!(105));
        let fill = mgr
            .ensure_protection(&h.gateway, &mut h.book, &sym, &h.pnl, &h.events, 1)
            .unwrap();
        assert!(fill.position_closed);
        assert!(!h.book.contains(&sym));
        // gross 5 minus taker fees on both mock fills
        assert!(h.pnl.realized_net() > Decimal::ZERO);
    }
}
