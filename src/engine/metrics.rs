use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::types::{PerformanceMetrics, SimulatedTrade, SymbolMetrics};

/// Annual risk-free rate for Sharpe/Sortino; shared with the Greeks pricer.
const RISK_FREE_RATE: f64 = 0.04;

/// Finite stand-in for an infinite profit factor (no losing trades).
/// Avoids `f64::INFINITY`, which is not valid JSON.
const MAX_PROFIT_FACTOR: f64 = 999.99;

/// Ceiling on annualised trade frequency (roughly one per trading day).
const MAX_TRADES_PER_YEAR: f64 = 252.0;

/// Van Tharp caps the SQN sample size at 100 trades.
const SQN_SAMPLE_CAP: usize = 100;

/// Computes performance statistics from closed trades. Pure: the same trade
/// list and capital always produce the same metrics.
pub struct MetricsCalculator {
    initial_capital: f64,
}

impl Default for MetricsCalculator {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
        }
    }
}

impl MetricsCalculator {
    pub fn new(initial_capital: f64) -> Self {
        Self { initial_capital }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn calculate(&self, trades: &[SimulatedTrade]) -> PerformanceMetrics {
        let closed: Vec<&SimulatedTrade> = trades.iter().filter(|t| t.is_closed()).collect();
        if closed.is_empty() {
            return PerformanceMetrics::default();
        }

        let mut m = PerformanceMetrics {
            total_trades: closed.len(),
            ..PerformanceMetrics::default()
        };

        let winners: Vec<&&SimulatedTrade> =
            closed.iter().filter(|t| t.final_pnl > 0.0).collect();
        let losers: Vec<&&SimulatedTrade> =
            closed.iter().filter(|t| t.final_pnl <= 0.0).collect();

        m.winning_trades = winners.len();
        m.losing_trades = losers.len();
        m.win_rate = winners.len() as f64 / closed.len() as f64;

        m.total_pnl = closed.iter().map(|t| t.final_pnl).sum();
        m.gross_profit = winners.iter().map(|t| t.final_pnl).sum();
        m.gross_loss = losers.iter().map(|t| t.final_pnl).sum::<f64>().abs();
        m.average_pnl = m.total_pnl / closed.len() as f64;
        m.average_winner = if winners.is_empty() {
            0.0
        } else {
            m.gross_profit / winners.len() as f64
        };
        m.average_loser = if losers.is_empty() {
            0.0
        } else {
            m.gross_loss / losers.len() as f64
        };

        m.profit_factor = if m.gross_loss > 0.0 {
            m.gross_profit / m.gross_loss
        } else {
            MAX_PROFIT_FACTOR
        };

        let loss_rate = 1.0 - m.win_rate;
        m.expectancy = m.win_rate * m.average_winner - loss_rate * m.average_loser;

        m.total_return_pct = m.total_pnl / self.initial_capital * 100.0;
        m.cagr = self.calculate_cagr(&closed, m.total_pnl);

        let equity_curve = self.build_equity_curve(&closed);
        let returns = daily_returns(&equity_curve);
        if !returns.is_empty() {
            let tpy = trades_per_year(returns.len(), &equity_curve);
            m.volatility = std_dev_population(&returns) * tpy.sqrt() * 100.0;
            m.sharpe_ratio = sharpe(&returns, tpy);
            m.sortino_ratio = sortino(&returns, tpy);
        }

        let (max_dd, max_dd_pct, max_duration) = drawdown(&equity_curve);
        m.max_drawdown = max_dd;
        m.max_drawdown_pct = max_dd_pct;
        m.max_drawdown_duration_days = max_duration;

        if m.max_drawdown_pct > 0.0 {
            m.calmar_ratio = Some(m.cagr / m.max_drawdown_pct);
            m.ret_dd = Some(m.total_return_pct / m.max_drawdown_pct);
        }

        m.sqn = sqn(&closed);

        m.avg_days_in_trade =
            closed.iter().map(|t| t.days_in_trade as f64).sum::<f64>() / closed.len() as f64;
        m.avg_days_winner = mean_days(&winners);
        m.avg_days_loser = mean_days(&losers);

        let (max_wins, max_losses) = consecutive_streaks(&closed);
        m.max_consecutive_wins = max_wins;
        m.max_consecutive_losses = max_losses;

        for trade in &closed {
            if let Some(reason) = trade.exit_reason {
                *m.exits_by_reason
                    .entry(reason.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        m.metrics_by_symbol = self.per_symbol(&closed);

        m
    }

    fn calculate_cagr(&self, closed: &[&SimulatedTrade], total_pnl: f64) -> f64 {
        let Some(start) = closed.iter().map(|t| t.entry_date).min() else {
            return 0.0;
        };
        let Some(end) = closed.iter().filter_map(|t| t.exit_date).max() else {
            return 0.0;
        };

        let years = ((end - start).num_days() as f64 / 365.0).max(0.1);
        let final_value = self.initial_capital + total_pnl;
        if final_value <= 0.0 {
            return -100.0;
        }
        ((final_value / self.initial_capital).powf(1.0 / years) - 1.0) * 100.0
    }

    /// Equity over trades sorted by exit date.
    fn build_equity_curve(&self, closed: &[&SimulatedTrade]) -> Vec<(NaiveDate, f64)> {
        let mut by_exit: Vec<&&SimulatedTrade> =
            closed.iter().filter(|t| t.exit_date.is_some()).collect();
        by_exit.sort_by_key(|t| t.exit_date);

        let mut equity = self.initial_capital;
        by_exit
            .iter()
            .map(|t| {
                equity += t.final_pnl;
                (t.exit_date.unwrap_or(t.entry_date), equity)
            })
            .collect()
    }

    fn per_symbol(&self, closed: &[&SimulatedTrade]) -> BTreeMap<String, SymbolMetrics> {
        let mut groups: BTreeMap<String, Vec<&SimulatedTrade>> = BTreeMap::new();
        for &trade in closed {
            groups.entry(trade.symbol.clone()).or_default().push(trade);
        }

        groups
            .into_iter()
            .map(|(symbol, trades)| {
                let winners: Vec<&&SimulatedTrade> =
                    trades.iter().filter(|t| t.final_pnl > 0.0).collect();
                let losers: Vec<&&SimulatedTrade> =
                    trades.iter().filter(|t| t.final_pnl <= 0.0).collect();
                let total_pnl: f64 = trades.iter().map(|t| t.final_pnl).sum();
                let gross_profit: f64 = winners.iter().map(|t| t.final_pnl).sum();
                let gross_loss: f64 = losers.iter().map(|t| t.final_pnl).sum::<f64>().abs();

                let curve = self.build_equity_curve(&trades);
                let returns = daily_returns(&curve);
                let sharpe_ratio = if trades.len() < 2 || returns.is_empty() {
                    0.0
                } else {
                    sharpe(&returns, trades_per_year(returns.len(), &curve))
                };

                (
                    symbol,
                    SymbolMetrics {
                        total_trades: trades.len(),
                        win_rate: winners.len() as f64 / trades.len() as f64,
                        total_pnl,
                        avg_pnl: total_pnl / trades.len() as f64,
                        avg_winner: if winners.is_empty() {
                            0.0
                        } else {
                            gross_profit / winners.len() as f64
                        },
                        avg_loser: if losers.is_empty() {
                            0.0
                        } else {
                            gross_loss / losers.len() as f64
                        },
                        profit_factor: if gross_loss > 0.0 {
                            gross_profit / gross_loss
                        } else {
                            MAX_PROFIT_FACTOR
                        },
                        sharpe_ratio,
                    },
                )
            })
            .collect()
    }
}

fn mean_days(trades: &[&&SimulatedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().map(|t| t.days_in_trade as f64).sum::<f64>() / trades.len() as f64
}

fn daily_returns(curve: &[(NaiveDate, f64)]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0].1 > 0.0)
        .map(|w| (w[1].1 - w[0].1) / w[0].1)
        .collect()
}

/// Annualised trade frequency from the equity curve's actual span, capped to
/// one trade per trading day.
fn trades_per_year(num_returns: usize, curve: &[(NaiveDate, f64)]) -> f64 {
    if curve.len() < 2 {
        return (num_returns as f64).min(52.0);
    }
    let period_days = (curve[curve.len() - 1].0 - curve[0].0).num_days();
    if period_days <= 0 {
        return (num_returns as f64).min(52.0);
    }
    (num_returns as f64 / (period_days as f64 / 365.0)).clamp(0.0, MAX_TRADES_PER_YEAR)
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev_population(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data);
    (data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64).sqrt()
}

fn sharpe(returns: &[f64], tpy: f64) -> f64 {
    let std = std_dev_population(returns);
    if std == 0.0 {
        return 0.0;
    }
    let annual_return = mean(returns) * tpy;
    let annual_vol = std * tpy.sqrt();
    (annual_return - RISK_FREE_RATE) / annual_vol
}

/// Like Sharpe but the denominator only penalises downside variance.
fn sortino(returns: &[f64], tpy: f64) -> f64 {
    let downside_variance = returns
        .iter()
        .map(|r| r.min(0.0).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let downside = downside_variance.sqrt();
    if downside == 0.0 {
        return 0.0;
    }
    let annual_return = mean(returns) * tpy;
    (annual_return - RISK_FREE_RATE) / (downside * tpy.sqrt())
}

/// Max peak-to-trough distance (dollars and percent) and the longest
/// drawdown duration in days.
fn drawdown(curve: &[(NaiveDate, f64)]) -> (f64, f64, i64) {
    if curve.is_empty() {
        return (0.0, 0.0, 0);
    }

    let mut peak = curve[0].1;
    let mut max_dd = 0.0f64;
    let mut max_dd_pct = 0.0f64;
    let mut max_duration = 0i64;
    let mut drawdown_start: Option<NaiveDate> = None;

    for (date, equity) in curve {
        if *equity > peak {
            peak = *equity;
            drawdown_start = None;
        } else {
            let dd = peak - equity;
            if dd > max_dd {
                max_dd = dd;
                max_dd_pct = if peak > 0.0 { dd / peak * 100.0 } else { 0.0 };
            }
            match drawdown_start {
                None => drawdown_start = Some(*date),
                Some(start) => {
                    max_duration = max_duration.max((*date - start).num_days());
                }
            }
        }
    }

    (max_dd, max_dd_pct, max_duration)
}

/// Van Tharp's System Quality Number over R-multiples.
fn sqn(closed: &[&SimulatedTrade]) -> f64 {
    if closed.len() < 2 {
        return 0.0;
    }
    let r_multiples: Vec<f64> = closed
        .iter()
        .filter(|t| t.max_risk > 0.0)
        .map(|t| t.final_pnl / t.max_risk)
        .collect();
    if r_multiples.len() < 2 {
        return 0.0;
    }

    let std = std_dev_population(&r_multiples);
    if std == 0.0 {
        return 0.0;
    }

    let capped_n = r_multiples.len().min(SQN_SAMPLE_CAP);
    (capped_n as f64).sqrt() * mean(&r_multiples) / std
}

fn consecutive_streaks(closed: &[&SimulatedTrade]) -> (usize, usize) {
    let mut by_exit: Vec<&&SimulatedTrade> =
        closed.iter().filter(|t| t.exit_date.is_some()).collect();
    by_exit.sort_by_key(|t| t.exit_date);

    let mut max_wins = 0;
    let mut max_losses = 0;
    let mut wins = 0;
    let mut losses = 0;

    for trade in by_exit {
        if trade.final_pnl > 0.0 {
            wins += 1;
            losses = 0;
            max_wins = max_wins.max(wins);
        } else {
            losses += 1;
            wins = 0;
            max_losses = max_losses.max(losses);
        }
    }
    (max_wins, max_losses)
}

/// Performance degradation from in-sample to out-of-sample, 0-100.
///
/// `None` when the out-of-sample partition has no trades. Only penalises the
/// directions in which out-of-sample is worse; a strategy that holds up out
/// of sample scores 0. An exactly-zero in-sample Sharpe leaves no ratio to
/// degrade against: the score collapses to 100 or 0 on the out-of-sample
/// Sharpe's sign alone, with no win-rate blend.
pub fn degradation_score(
    in_sample: &PerformanceMetrics,
    out_sample: &PerformanceMetrics,
) -> Option<f64> {
    if out_sample.total_trades == 0 {
        return None;
    }

    if in_sample.sharpe_ratio == 0.0 {
        return Some(if out_sample.sharpe_ratio <= 0.0 {
            100.0
        } else {
            0.0
        });
    }

    let sharpe_degradation = if out_sample.sharpe_ratio >= in_sample.sharpe_ratio {
        0.0
    } else {
        (in_sample.sharpe_ratio - out_sample.sharpe_ratio) / in_sample.sharpe_ratio
    };

    let winrate_degradation = if in_sample.win_rate > 0.0 {
        if out_sample.win_rate >= in_sample.win_rate {
            0.0
        } else {
            (in_sample.win_rate - out_sample.win_rate) / in_sample.win_rate
        }
    } else {
        0.0
    };

    let score = (sharpe_degradation * 0.7 + winrate_degradation * 0.3) * 100.0;
    Some(score.clamp(0.0, 100.0))
}
