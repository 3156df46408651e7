use thiserror::Error;

use super::metrics::{degradation_score, MetricsCalculator};
use super::signals::SignalGenerator;
use super::simulator::TradeSimulator;
use super::types::{BacktestResult, EquityPoint, ExitReason, SimulatedTrade};
use crate::config::BacktestConfig;
use crate::data::loader::{all_trading_dates, split_by_ratio, DataLoader, IvData};
use crate::data::EarningsCalendar;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("backtest cancelled by caller")]
    Cancelled,
}

/// Progress sink: receives a message and a 0-100 percentage; returning
/// `false` cancels the run between simulated days.
pub type ProgressCallback = Box<dyn Fn(&str, f64) -> bool + Send + Sync>;

/// Orchestrates a complete backtest: load, split, simulate both partitions,
/// compute metrics and degradation, validate.
///
/// The engine owns one simulator per partition; loaded series are immutable
/// once the loader returns. Cancellation never commits a partial result.
pub struct BacktestEngine {
    config: BacktestConfig,
    progress: Option<ProgressCallback>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the full backtest. An empty data set yields an invalid result,
    /// not an error; cancellation aborts with `BacktestError::Cancelled`.
    pub fn run(&self) -> Result<BacktestResult, BacktestError> {
        self.report("initializing backtest", 0.0)?;

        let mut result = BacktestResult {
            config_summary: serde_json::to_value(&self.config).unwrap_or_default(),
            start_date: Some(self.config.start_date),
            end_date: Some(self.config.end_date),
            is_valid: true,
            ..BacktestResult::default()
        };

        let loader = DataLoader::new(&self.config);
        let earnings = loader.load_earnings_calendar();

        self.report("loading historical IV data", 5.0)?;
        let iv_data = loader.load_all();
        if iv_data.is_empty() {
            tracing::error!("no IV data available, cannot run backtest");
            result.is_valid = false;
            result
                .validation_messages
                .push("No IV data loaded for any symbol".to_string());
            return Ok(result);
        }

        self.report("splitting in-sample / out-of-sample", 10.0)?;
        let (in_sample_data, out_sample_data, split_dates) =
            split_by_ratio(&iv_data, self.config.sample_split.in_sample_ratio);
        result.split_dates = split_dates;

        self.report("running in-sample simulation", 15.0)?;
        let in_sample_trades =
            self.run_simulation(&in_sample_data, &earnings, "in-sample", 15.0, 45.0)?;

        self.report("running out-of-sample simulation", 50.0)?;
        let out_sample_trades =
            self.run_simulation(&out_sample_data, &earnings, "out-of-sample", 50.0, 80.0)?;

        self.report("calculating performance metrics", 85.0)?;
        let calculator = MetricsCalculator::default();
        let in_metrics = calculator.calculate(&in_sample_trades);
        let out_metrics = calculator.calculate(&out_sample_trades);

        result.in_sample_trade_count = in_sample_trades.len();
        result.out_sample_trade_count = out_sample_trades.len();
        result.trades = in_sample_trades;
        result.trades.extend(out_sample_trades);
        result.combined_metrics = Some(calculator.calculate(&result.trades));

        self.report("analysing degradation", 90.0)?;
        result.degradation_score = degradation_score(&in_metrics, &out_metrics);
        result.in_sample_metrics = Some(in_metrics);
        result.out_sample_metrics = Some(out_metrics);

        self.report("building equity curve", 95.0)?;
        result.equity_curve = build_equity_curve(&result.trades, calculator.initial_capital());

        self.validate(&mut result);
        self.report("backtest complete", 100.0)?;
        log_summary(&result);

        Ok(result)
    }

    /// Drive one partition day by day. Existing positions are processed
    /// before new entries, so a trade closed on day D can never reopen on D.
    fn run_simulation(
        &self,
        iv_data: &IvData,
        earnings: &EarningsCalendar,
        period_name: &str,
        progress_start: f64,
        progress_end: f64,
    ) -> Result<Vec<SimulatedTrade>, BacktestError> {
        let mut simulator = TradeSimulator::new(self.config.clone());
        let mut generator = SignalGenerator::new(self.config.clone(), earnings.clone());

        let trading_dates = all_trading_dates(iv_data);
        if trading_dates.is_empty() {
            tracing::warn!(period = period_name, "no trading dates in partition");
            return Ok(Vec::new());
        }

        let total_days = trading_dates.len();
        tracing::info!(period = period_name, days = total_days, "simulating");

        for (i, current_date) in trading_dates.iter().enumerate() {
            let progress = progress_start
                + (progress_end - progress_start) * (i as f64 / total_days as f64);
            self.report(
                &format!("simulating {period_name}: {current_date}"),
                progress,
            )?;

            simulator.process_day(*current_date, iv_data);

            let open_symbols = simulator.open_position_symbols();
            let signals = generator.scan_for_signals(iv_data, *current_date, &open_symbols);
            for signal in &signals {
                simulator.open_trade(signal, signal.term_at_entry);
            }
        }

        if simulator.open_position_count() > 0 {
            let last = trading_dates[trading_dates.len() - 1];
            simulator.force_close_all(last, ExitReason::Manual);
        }

        let summary = simulator.summary();
        tracing::info!(
            period = period_name,
            trades = summary.total_trades,
            win_rate = summary.win_rate,
            total_pnl = summary.total_pnl,
            rr_rejections = summary.rr_rejections,
            earnings_blocks = generator.earnings_blocks(),
            "partition complete"
        );

        Ok(simulator.into_trades())
    }

    fn validate(&self, result: &mut BacktestResult) {
        let mut messages = Vec::new();

        if result.trades.len() < 30 {
            messages.push(format!(
                "Warning: only {} trades - results may not be statistically significant",
                result.trades.len()
            ));
        }

        if let Some(score) = result.degradation_score {
            if score > 50.0 {
                messages.push(format!(
                    "Warning: high degradation score ({score:.1}%) - strategy may be overfit to in-sample data"
                ));
            }
        }

        if let Some(out) = &result.out_sample_metrics {
            if out.total_trades > 0 && out.total_pnl < 0.0 {
                messages.push("Warning: out-of-sample period is unprofitable".to_string());
            }
        }

        if let Some(combined) = &result.combined_metrics {
            if combined.total_trades > 0 && combined.win_rate < 0.30 {
                messages.push(format!(
                    "Warning: low win rate ({:.1}%) - review entry criteria",
                    combined.win_rate * 100.0
                ));
            }
        }

        result.is_valid = messages.len() < 3;
        result.validation_messages = messages;
    }

    fn report(&self, message: &str, percent: f64) -> Result<(), BacktestError> {
        tracing::debug!(percent, "{message}");
        if let Some(callback) = &self.progress {
            if !callback(message, percent) {
                tracing::warn!("backtest cancelled at {percent:.0}%");
                return Err(BacktestError::Cancelled);
            }
        }
        Ok(())
    }
}

/// Equity curve over closed trades sorted by exit date.
fn build_equity_curve(trades: &[SimulatedTrade], initial_capital: f64) -> Vec<EquityPoint> {
    let mut closed: Vec<&SimulatedTrade> = trades
        .iter()
        .filter(|t| t.is_closed() && t.exit_date.is_some())
        .collect();
    closed.sort_by_key(|t| t.exit_date);

    let mut cumulative_pnl = 0.0;
    closed
        .iter()
        .filter_map(|t| {
            cumulative_pnl += t.final_pnl;
            t.exit_date.map(|date| EquityPoint {
                date,
                equity: initial_capital + cumulative_pnl,
                cumulative_pnl,
                trade_pnl: t.final_pnl,
                symbol: t.symbol.clone(),
                exit_reason: t.exit_reason,
            })
        })
        .collect()
}

fn log_summary(result: &BacktestResult) {
    let Some(m) = &result.combined_metrics else {
        return;
    };
    tracing::info!(
        trades = m.total_trades,
        win_rate = %format!("{:.1}%", m.win_rate * 100.0),
        total_pnl = %format!("{:.2}", m.total_pnl),
        sharpe = %format!("{:.2}", m.sharpe_ratio),
        sqn = %format!("{:.2}", m.sqn),
        max_drawdown_pct = %format!("{:.1}%", m.max_drawdown_pct),
        degradation = ?result.degradation_score,
        valid = result.is_valid,
        "backtest summary"
    );
    for message in &result.validation_messages {
        tracing::info!("{message}");
    }
}
