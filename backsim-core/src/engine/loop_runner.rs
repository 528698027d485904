//! One timestep of the simulation, phase by phase.

use super::calendar::{mtm_due, new_day, new_week};
use super::state::{PendingEntry, PendingExit};
use super::BacktestEngine;
use crate::data::resolve_bar;
use crate::domain::{Bar, CorporateActionKind, ExitReason, PositionSide};
use crate::error::{OrderRejection, RiskLimitKind};
use crate::execution::{mark_price, ExecutionModel, OrderSide};
use crate::portfolio::Fill;
use crate::rebalance::Rebalancer;
use crate::signal::SignalContext;
use crate::strategy::{atr, EntrySignal, ExitRequest, SignalBatch, ATR_PERIOD};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Bars resolved for one calendar timestamp.
pub(crate) struct StepContext {
    pub step: usize,
    /// Position in the data index.
    pub index: usize,
    pub timestamp: NaiveDateTime,
    pub bars: BTreeMap<String, Bar>,
}

impl BacktestEngine {
    pub(super) async fn step(&mut self, step: usize) {
        let index = self.calendar[step];
        let timestamp = self.data.index[index];

        // ─── Phase 1: resolve data, roll drawdown windows ───
        let ctx = self.resolve_step(step, index, timestamp);
        self.roll_boundaries(timestamp);

        // ─── Phase 2: orders queued at the previous bar ───
        if self.execution.is_deferred() {
            self.fill_pending(&ctx);
        }

        // ─── Phase 3: mark-to-market ───
        let next = self.calendar.get(step + 1).map(|i| self.data.index[*i]);
        if mtm_due(self.config.mtm.frequency, timestamp, next) {
            self.mark(&ctx);
        }

        // ─── Phase 4: corporate actions, borrow ───
        self.apply_corporate_actions(&ctx);
        self.accrue_borrow(&ctx);

        // ─── Phase 5: drawdown limits ───
        self.state.portfolio.check_drawdown_limits();

        // ─── Phase 6: rebalance ───
        let cached_entries = self.rebalance(&ctx).await;

        // ─── Phase 7: exits ───
        self.process_exits(&ctx).await;

        // ─── Phase 8: entries ───
        self.process_entries(&ctx, cached_entries).await;

        // ─── Phase 9: persist ───
        self.state.prev_timestamp = Some(timestamp);
        self.state.cursor = step + 1;
        trace!(step, %timestamp, value = self.state.portfolio.value(), "step complete");
    }

    fn resolve_step(&mut self, step: usize, index: usize, timestamp: NaiveDateTime) -> StepContext {
        let policy = self.config.execution.missing_data;
        let mut bars = BTreeMap::new();
        for ticker in &self.config.market_data.universe {
            let Some(series) = self.data.series(ticker) else {
                continue;
            };
            if let Some(bar) = resolve_bar(series, index, timestamp, policy) {
                self.state.last_prices.insert(ticker.clone(), bar.close);
                bars.insert(ticker.clone(), bar);
            }
        }
        StepContext {
            step,
            index,
            timestamp,
            bars,
        }
    }

    fn roll_boundaries(&mut self, timestamp: NaiveDateTime) {
        let Some(prev) = self.state.prev_timestamp else {
            return;
        };
        if new_day(prev, timestamp) {
            self.state.portfolio.reset_daily_peak();
        }
        if new_week(prev, timestamp) {
            self.state.portfolio.reset_weekly_peak();
        }
    }

    fn signal_context(&self, ctx: &StepContext, ticker: &str) -> SignalContext {
        SignalContext {
            data: Arc::clone(&self.data),
            ticker: ticker.to_string(),
            index: ctx.index,
            timestamp: ctx.timestamp,
            bar: ctx.bars.get(ticker).cloned(),
            step: ctx.step,
            calendar_len: self.calendar.len(),
        }
    }

    fn atr_for(&self, ticker: &str, index: usize) -> Option<f64> {
        atr(&self.data.recent_bars(ticker, index, ATR_PERIOD + 1), ATR_PERIOD)
    }

    fn record_signal_stats<T>(&mut self, batch: &SignalBatch<T>) {
        self.state.signal_timeouts += batch.timeouts;
        self.state.signal_errors += batch.errors;
    }

    // ─── Order execution ─────────────────────────────────────────────

    /// Close a whole position at `raw_price` after slippage and costs.
    fn exit_position(&mut self, ticker: &str, raw_price: f64, timestamp: NaiveDateTime, reason: ExitReason) {
        let Some(quantity) = self.state.portfolio.position(ticker).map(|p| p.quantity) else {
            return;
        };
        let side = OrderSide::for_quantity(quantity).opposite();
        let price = self.execution.apply_slippage(raw_price, side);
        let costs = self.execution.transaction_cost(quantity, price);
        self.state
            .portfolio
            .close_position(ticker, price, costs, timestamp, reason);
    }

    /// Size, validate and book a new position at `raw_price`.
    fn enter_position(&mut self, ctx: &StepContext, ticker: &str, side: PositionSide, raw_price: f64) {
        let order_side = match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        };
        let price = self.execution.apply_slippage(raw_price, order_side);
        let atr = if self.strategy.exit_rules().needs_atr() {
            self.atr_for(ticker, ctx.index)
        } else {
            None
        };
        let capital = self.state.portfolio.value();
        let quantity = match self.strategy.calculate_position_size(capital, price, atr) {
            Ok(q) => side.sign() * q,
            Err(err) => {
                self.state.reject(ctx.timestamp, ticker, 0.0, err.into());
                return;
            }
        };
        let fill = Fill {
            ticker: ticker.to_string(),
            quantity,
            price,
            costs: self.execution.transaction_cost(quantity, price),
            timestamp: ctx.timestamp,
            sector: self.data.sector(ticker).map(str::to_string),
        };
        match self.state.portfolio.open_position(fill) {
            Ok(()) => {
                if let Some(pos) = self.state.portfolio.positions.get_mut(ticker) {
                    pos.entry_atr = atr;
                }
                self.strategy.signals().entry_filled(ticker, ctx.timestamp);
            }
            Err(reason) => self.state.reject(ctx.timestamp, ticker, quantity, reason),
        }
    }

    // ─── Phase 2 ─────────────────────────────────────────────────────

    fn fill_pending(&mut self, ctx: &StepContext) {
        let exits = std::mem::take(&mut self.state.pending_exits);
        for exit in exits {
            if !self.state.portfolio.has_position(&exit.ticker) {
                continue;
            }
            match ctx.bars.get(&exit.ticker) {
                Some(bar) => self.exit_position(&exit.ticker, bar.open, ctx.timestamp, exit.reason),
                // No bar yet: try again at the next one.
                None => self.state.pending_exits.push(exit),
            }
        }

        let entries = std::mem::take(&mut self.state.pending_entries);
        for entry in entries {
            match ctx.bars.get(&entry.ticker).map(|b| b.open) {
                Some(open) => self.enter_position(ctx, &entry.ticker, entry.side, open),
                None => self
                    .state
                    .reject(ctx.timestamp, &entry.ticker, 0.0, OrderRejection::NoPrice),
            }
        }
    }

    // ─── Phase 3 ─────────────────────────────────────────────────────

    fn mark(&mut self, ctx: &StepContext) {
        let source = self.config.mtm.price;
        let prices: BTreeMap<String, f64> = self
            .state
            .portfolio
            .positions
            .keys()
            .filter_map(|t| ctx.bars.get(t).map(|b| (t.clone(), mark_price(b, source))))
            .collect();
        let dd = self.state.portfolio.mark_to_market(&prices, ctx.timestamp);
        self.state.portfolio.verify_equity();
        self.state.last_mtm_step = Some(ctx.step);
        debug!(
            step = ctx.step,
            value = dd.value,
            daily_dd = dd.daily_drawdown,
            weekly_dd = dd.weekly_drawdown,
            "marked to market"
        );
    }

    // ─── Phase 4 ─────────────────────────────────────────────────────

    fn apply_corporate_actions(&mut self, ctx: &StepContext) {
        let data = Arc::clone(&self.data);
        for action in data.actions_between(self.state.prev_timestamp, ctx.timestamp) {
            let ticker = action.ticker.as_str();
            match action.kind {
                CorporateActionKind::Dividend { amount_per_share } => {
                    if self.config.mtm.book_dividend_cashflows {
                        self.state.portfolio.apply_dividend(ticker, amount_per_share);
                    }
                }
                CorporateActionKind::Split { ratio } => {
                    if self.config.mtm.adjust_for_splits {
                        self.state.portfolio.apply_split(ticker, ratio);
                    }
                }
                CorporateActionKind::Delisting => self.delist(ctx, ticker),
            }
        }
    }

    fn delist(&mut self, ctx: &StepContext, ticker: &str) {
        info!(ticker, timestamp = %ctx.timestamp, "ticker delisted");
        self.state.delisted.insert(ticker.to_string());
        self.state.pending_entries.retain(|e| e.ticker != ticker);
        self.state.pending_exits.retain(|e| e.ticker != ticker);
        let last = ctx
            .bars
            .get(ticker)
            .map(|b| b.close)
            .or_else(|| self.state.last_prices.get(ticker).copied())
            .or_else(|| self.state.portfolio.position(ticker).map(|p| p.current_price));
        if let Some(price) = last {
            self.exit_position(ticker, price, ctx.timestamp, ExitReason::Delisted);
        }
    }

    fn accrue_borrow(&mut self, ctx: &StepContext) {
        let Some(prev) = self.state.prev_timestamp else {
            return;
        };
        let days = (ctx.timestamp.date() - prev.date()).num_days();
        if days <= 0 || self.execution.borrow_rate == 0.0 {
            return;
        }
        let charges: Vec<(String, f64)> = self
            .state
            .portfolio
            .positions
            .values()
            .filter(|p| p.is_short())
            .map(|p| {
                let cost = self.execution.borrow_cost(p.market_value(), days as f64);
                (p.ticker.clone(), cost)
            })
            .collect();
        for (ticker, cost) in charges {
            self.state.portfolio.accrue_borrow(&ticker, cost);
        }
    }

    // ─── Phase 6 ─────────────────────────────────────────────────────

    /// Returns the entry batch if the signal trigger had to evaluate it.
    async fn rebalance(&mut self, ctx: &StepContext) -> Option<SignalBatch<EntrySignal>> {
        if self.rebalancer.exit_ineligible() {
            let ineligible: Vec<String> = self
                .state
                .portfolio
                .positions
                .keys()
                .filter(|t| !self.strategy.is_eligible(t) && !self.state.has_pending_exit(t))
                .cloned()
                .collect();
            for ticker in ineligible {
                if let Some(close) = ctx.bars.get(&ticker).map(|b| b.close) {
                    self.exit_position(&ticker, close, ctx.timestamp, ExitReason::Ineligible);
                }
            }
        }

        if !self.rebalancer.is_enabled() {
            return None;
        }

        let mut cached = None;
        let signal_fired = if self.rebalancer.uses_signal_trigger() {
            let batch = self.entry_batch(ctx).await;
            let fired = !batch.items.is_empty();
            cached = Some(batch);
            fired
        } else {
            false
        };

        let targets = self
            .rebalancer
            .target_weights(&self.state.portfolio, &self.data, ctx.index);
        let drift = Rebalancer::max_drift(&self.state.portfolio, &targets);
        if !self
            .rebalancer
            .should_rebalance(self.state.prev_timestamp, ctx.timestamp, drift, signal_fired)
        {
            return cached;
        }

        let source = self.config.mtm.price;
        let prices: BTreeMap<String, f64> = ctx
            .bars
            .iter()
            .map(|(t, b)| (t.clone(), mark_price(b, source)))
            .collect();
        let orders = self.rebalancer.plan(&self.state.portfolio, &targets, &prices);
        info!(
            timestamp = %ctx.timestamp,
            drift,
            orders = orders.len(),
            "rebalancing"
        );

        for order in orders {
            if self.state.has_pending_exit(&order.ticker) || self.state.delisted.contains(&order.ticker) {
                continue;
            }
            let side = OrderSide::for_quantity(order.delta);
            let price = self.execution.apply_slippage(order.price, side);
            let costs = self.execution.transaction_cost(order.delta, price);
            let outcome = if self.state.portfolio.has_position(&order.ticker) {
                self.state
                    .portfolio
                    .adjust_position(&order.ticker, order.delta, price, costs, ctx.timestamp)
                    .map(|_| ())
            } else if self.state.committed_slots() >= self.strategy.max_positions() {
                Err(RiskLimitKind::MaxPositions {
                    limit: self.strategy.max_positions(),
                }
                .into())
            } else {
                self.state.portfolio.open_position(Fill {
                    ticker: order.ticker.clone(),
                    quantity: order.delta,
                    price,
                    costs,
                    timestamp: ctx.timestamp,
                    sector: self.data.sector(&order.ticker).map(str::to_string),
                })
            };
            if let Err(reason) = outcome {
                self.state
                    .reject(ctx.timestamp, &order.ticker, order.delta, reason);
            }
        }
        cached
    }

    // ─── Phase 7 ─────────────────────────────────────────────────────

    async fn process_exits(&mut self, ctx: &StepContext) {
        let needs_atr = self.strategy.exit_rules().needs_atr();
        let tickers: Vec<String> = self.state.portfolio.positions.keys().cloned().collect();
        let mut requests = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            if self.state.has_pending_exit(&ticker) {
                continue;
            }
            let Some(price) = ctx.bars.get(&ticker).map(|b| b.close) else {
                continue;
            };
            let Some(pos) = self.state.portfolio.positions.get_mut(&ticker) else {
                continue;
            };
            pos.track_extremes(price);
            let current_atr = if needs_atr {
                atr(&self.data.recent_bars(&ticker, ctx.index, ATR_PERIOD + 1), ATR_PERIOD)
            } else {
                None
            };
            // Positions opened without an ATR (rebalance, warm-up) anchor on the first one seen.
            if pos.entry_atr.is_none() {
                pos.entry_atr = current_atr;
            }
            let position = pos.clone();
            requests.push(ExitRequest {
                context: self.signal_context(ctx, &ticker),
                position,
                price,
                atr: current_atr,
            });
        }
        if requests.is_empty() {
            return;
        }

        let batch = self.strategy.evaluate_exits(requests).await;
        self.record_signal_stats(&batch);

        let timing = self.execution.timing;
        for decision in batch.items {
            if self.execution.is_deferred() {
                self.state.pending_exits.push(PendingExit {
                    ticker: decision.ticker,
                    reason: decision.reason,
                    decided_at: ctx.timestamp,
                });
            } else if let Some(raw) = ctx
                .bars
                .get(&decision.ticker)
                .map(|b| ExecutionModel::fill_price(b, timing))
            {
                self.exit_position(&decision.ticker, raw, ctx.timestamp, decision.reason);
            }
        }
    }

    // ─── Phase 8 ─────────────────────────────────────────────────────

    async fn entry_batch(&mut self, ctx: &StepContext) -> SignalBatch<EntrySignal> {
        let excluded = self.state.entry_exclusions();
        let contexts: Vec<SignalContext> = self
            .strategy
            .filter_eligible_universe(&ctx.bars, &excluded)
            .iter()
            .map(|t| self.signal_context(ctx, t))
            .collect();
        if contexts.is_empty() {
            return SignalBatch::default();
        }
        let batch = self.strategy.generate_entry_signals(contexts).await;
        self.record_signal_stats(&batch);
        batch
    }

    async fn process_entries(&mut self, ctx: &StepContext, cached: Option<SignalBatch<EntrySignal>>) {
        if self.state.portfolio.is_halted() {
            if cached.as_ref().is_some_and(|b| !b.items.is_empty()) {
                debug!(timestamp = %ctx.timestamp, "halted, skipping entries");
            }
            return;
        }
        let committed = self.state.committed_slots();
        let max = self.strategy.max_positions();
        if committed >= max {
            return;
        }
        let slots = max - committed;

        let batch = match cached {
            Some(batch) => batch,
            None => self.entry_batch(ctx).await,
        };
        let excluded = self.state.entry_exclusions();
        let signals: Vec<EntrySignal> = batch
            .items
            .into_iter()
            .filter(|s| !excluded.contains(&s.ticker))
            .collect();
        if signals.is_empty() {
            return;
        }

        let ranked = self
            .strategy
            .rank_signals(signals, slots, &self.data, ctx.index, &ctx.bars);
        debug!(timestamp = %ctx.timestamp, selected = ranked.len(), slots, "entry signals");

        let timing = self.execution.timing;
        for signal in ranked {
            if self.execution.is_deferred() {
                self.state.pending_entries.push(PendingEntry {
                    ticker: signal.ticker,
                    side: signal.side,
                    decided_at: ctx.timestamp,
                });
                continue;
            }
            match ctx
                .bars
                .get(&signal.ticker)
                .map(|b| ExecutionModel::fill_price(b, timing))
            {
                Some(raw) => self.enter_position(ctx, &signal.ticker, signal.side, raw),
                None => self.state.reject(
                    ctx.timestamp,
                    &signal.ticker,
                    0.0,
                    OrderRejection::NoPrice,
                ),
            }
        }
    }
}
