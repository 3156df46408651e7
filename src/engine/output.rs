use std::path::Path;

use thiserror::Error;

use super::signals::SignalGenerator;
use super::types::{BacktestResult, SimulatedTrade};
use crate::config::BacktestConfig;
use crate::data::loader::{DataLoader, IvData};
use crate::data::EarningsCalendar;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export I/O failure")]
    Io(#[from] std::io::Error),
    #[error("export CSV failure")]
    Csv(#[from] csv::Error),
    #[error("export serialisation failure")]
    Json(#[from] serde_json::Error),
}

/// Writes the external-validation pack: raw inputs, per-day entry decisions,
/// trade summaries and daily snapshots, the configuration, and a formulas
/// document: enough for an outside party to re-derive every number.
pub struct ValidationExporter {
    config: BacktestConfig,
}

impl ValidationExporter {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn export(&self, result: &BacktestResult, out_dir: &Path) -> Result<(), ExportError> {
        let loader = DataLoader::new(&self.config);
        let iv_data = loader.load_all();

        std::fs::create_dir_all(out_dir)?;
        self.write_config(out_dir)?;
        self.write_input_data(out_dir, &iv_data, &loader)?;
        self.write_daily_decisions(out_dir, &iv_data)?;
        self.write_trades(out_dir, result)?;
        write_formulas(out_dir)?;
        write_readme(out_dir)?;

        tracing::info!(dir = %out_dir.display(), "validation pack exported");
        Ok(())
    }

    fn write_config(&self, out_dir: &Path) -> Result<(), ExportError> {
        let dir = out_dir.join("config");
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(dir.join("all_config.json"), json)?;
        Ok(())
    }

    fn write_input_data(
        &self,
        out_dir: &Path,
        iv_data: &IvData,
        loader: &DataLoader,
    ) -> Result<(), ExportError> {
        let dir = out_dir.join("input_data");
        std::fs::create_dir_all(&dir)?;

        for (symbol, series) in iv_data {
            let mut writer =
                csv::Writer::from_path(dir.join(format!("{symbol}_iv_with_percentile.csv")))?;
            writer.write_record([
                "date",
                "atm_iv",
                "iv_rank",
                "iv_percentile",
                "hv30",
                "skew",
                "term_m1_m2",
                "term_m1_m3",
                "spot_price",
            ])?;
            for point in series {
                writer.write_record([
                    point.date.to_string(),
                    fmt_opt(point.atm_iv),
                    fmt_opt(point.iv_rank),
                    fmt_opt(point.iv_percentile),
                    fmt_opt(point.hv30),
                    fmt_opt(point.skew),
                    fmt_opt(point.term_m1_m2),
                    fmt_opt(point.term_m1_m3),
                    fmt_opt(point.spot_price),
                ])?;
            }
            writer.flush()?;

            let bars = loader.load_spot_ohlc(symbol);
            let mut writer = csv::Writer::from_path(dir.join(format!("{symbol}_spot.csv")))?;
            writer.write_record(["date", "open", "high", "low", "close"])?;
            for bar in bars.values() {
                writer.write_record([
                    bar.date.to_string(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        Ok(())
    }

    /// Re-evaluate the entry rules for every (symbol, day), recording the
    /// decision an unconstrained book would have made.
    fn write_daily_decisions(&self, out_dir: &Path, iv_data: &IvData) -> Result<(), ExportError> {
        let dir = out_dir.join("evaluation");
        std::fs::create_dir_all(&dir)?;

        let generator = SignalGenerator::new(self.config.clone(), EarningsCalendar::default());

        for (symbol, series) in iv_data {
            let mut writer =
                csv::Writer::from_path(dir.join(format!("{symbol}_daily_decisions.csv")))?;
            writer.write_record([
                "date",
                "atm_iv",
                "iv_percentile",
                "iv_rank",
                "entry_signal",
                "signal_strength",
            ])?;
            for point in series {
                let signal = generator.evaluate_point(point);
                writer.write_record([
                    point.date.to_string(),
                    fmt_opt(point.atm_iv),
                    fmt_opt(point.iv_percentile),
                    fmt_opt(point.iv_rank),
                    signal.is_some().to_string(),
                    signal.map_or_else(String::new, |s| s.signal_strength.to_string()),
                ])?;
            }
            writer.flush()?;
        }
        Ok(())
    }

    fn write_trades(&self, out_dir: &Path, result: &BacktestResult) -> Result<(), ExportError> {
        let dir = out_dir.join("trades");
        std::fs::create_dir_all(&dir)?;

        let mut by_symbol: std::collections::BTreeMap<&str, Vec<&SimulatedTrade>> =
            std::collections::BTreeMap::new();
        for trade in &result.trades {
            by_symbol.entry(&trade.symbol).or_default().push(trade);
        }

        for (symbol, trades) in by_symbol {
            let mut writer =
                csv::Writer::from_path(dir.join(format!("{symbol}_trades_summary.csv")))?;
            writer.write_record([
                "entry_date",
                "exit_date",
                "strategy_type",
                "iv_at_entry",
                "iv_at_exit",
                "estimated_credit",
                "entry_debit",
                "max_risk",
                "days_in_trade",
                "exit_reason",
                "final_pnl",
            ])?;
            for trade in &trades {
                writer.write_record([
                    trade.entry_date.to_string(),
                    trade
                        .exit_date
                        .map_or_else(String::new, |d| d.to_string()),
                    trade.strategy_type.clone(),
                    trade.iv_at_entry.to_string(),
                    fmt_opt(trade.iv_at_exit),
                    trade.estimated_credit.to_string(),
                    fmt_opt(trade.entry_debit),
                    trade.max_risk.to_string(),
                    trade.days_in_trade.to_string(),
                    trade
                        .exit_reason
                        .map_or_else(String::new, |r| r.as_str().to_string()),
                    trade.final_pnl.to_string(),
                ])?;
            }
            writer.flush()?;

            let mut writer =
                csv::Writer::from_path(dir.join(format!("{symbol}_trades_daily_snapshots.csv")))?;
            writer.write_record(["entry_date", "date", "atm_iv", "unrealised_pnl"])?;
            for trade in &trades {
                for ((date, iv), pnl) in trade
                    .date_history
                    .iter()
                    .zip(&trade.iv_history)
                    .zip(&trade.pnl_history)
                {
                    writer.write_record([
                        trade.entry_date.to_string(),
                        date.to_string(),
                        iv.to_string(),
                        pnl.to_string(),
                    ])?;
                }
            }
            writer.flush()?;
        }
        Ok(())
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

fn write_formulas(out_dir: &Path) -> Result<(), ExportError> {
    let dir = out_dir.join("formulas");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("calculations.md"), FORMULAS_DOC)?;
    Ok(())
}

fn write_readme(out_dir: &Path) -> Result<(), ExportError> {
    std::fs::write(out_dir.join("README.md"), README_DOC)?;
    Ok(())
}

const FORMULAS_DOC: &str = r"# Calculations

## IV percentile and rank

Missing `iv_percentile` / `iv_rank` values are filled from a rolling
252-calendar-day window over prior same-symbol observations, requiring at
least 20 samples:

    iv_percentile = count(prior IV < current IV) / window_size * 100
    iv_rank       = (current - min) / (max - min) * 100   (only when max > min)

The window counts calendar days, not trading days, so gaps in the data
reduce the effective sample size. This is accepted behaviour.

## Iron condor credit estimate

    wing_width = 100 * configured_wing_points
    ratio      = clamp(0.20, 0.50,
                   0.30 * (iv / 0.20) * min(1.2, dte / 45) * stddev_adj)
    stddev_adj = clamp(0.5, 1.5, (1.5 / stddev_range) ^ 0.6)   # 1.0 when unset
    credit     = wing_width * ratio

## Iron condor daily mark

    vega_pnl  = (iv_entry - iv_current) * 100 * 1.5 * (max_risk / 100)
    theta_pnl = credit * sqrt(days_in_trade / target_dte) * 0.5
    total     = clamp(-max_risk, credit, vega_pnl + theta_pnl - costs)

## Calendar spread

    entry_debit = max(50, 0.70 * 0.4 * spot * iv
                        * (sqrt(far_dte/365) - sqrt(near_dte/365)) * 100)
    vega_pnl    = (iv_current - iv_entry) * 100 * 2.0 * (entry_debit / 100)
    theta_pnl   = entry_debit * min(1, (dit / near_dte) ^ 0.7) * 0.15
    term_pnl    = (term_entry - term_current) * (entry_debit / 100) * 0.5
    total       = clamp(-entry_debit, entry_debit,
                        vega_pnl + theta_pnl + term_pnl - costs)

## Exit priority

1. profit target  2. stop loss  3. time decay / near-leg DTE
4. delta breach (IV spike or spot move proxy)  5. IV collapse
6. max days in trade  7. expiration

Without IV data on a day, rules 1, 2, 4 and 5 are skipped.

## Degradation score

Intermediate degradations are fractions on a 0-1 scale; only the final
blend is expressed in percent. A zero in-sample Sharpe short-circuits on
the out-of-sample Sharpe's sign, with no win-rate blend.

    if IS.sharpe == 0:
        score = 100 if OOS.sharpe <= 0 else 0
    else:
        sharpe_deg  = 0 if OOS.sharpe >= IS.sharpe
                      else (IS.sharpe - OOS.sharpe) / IS.sharpe
        winrate_deg = 0 if IS.wr == 0 or OOS.wr >= IS.wr
                      else (IS.wr - OOS.wr) / IS.wr
        score       = clamp(0, 100, (0.7 * sharpe_deg + 0.3 * winrate_deg) * 100)

Undefined with no out-of-sample trades.
";

const README_DOC: &str = r"# Validation pack

Everything needed to independently re-derive this backtest:

- `config/all_config.json`: the exact configuration used.
- `input_data/{symbol}_iv_with_percentile.csv`: IV series after boundary
  normalisation and rolling percentile/rank fill.
- `input_data/{symbol}_spot.csv`: spot OHLC, when available.
- `evaluation/{symbol}_daily_decisions.csv`: the entry decision for every
  day, ignoring position limits.
- `trades/{symbol}_trades_summary.csv`: one row per simulated trade.
- `trades/{symbol}_trades_daily_snapshots.csv`: the daily mark for each
  trade while it was open.
- `formulas/calculations.md`: the formulas behind every derived number.
";
