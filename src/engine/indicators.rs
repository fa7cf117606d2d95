//! # engine::indicators
//!
//! Pure indicator math over candle closes. Every function takes a slice
//! ordered oldest → newest and returns a series of the same length, with
//! `NaN` where the window is not yet full, so series line up by index.
//!
//! ```text
//! SMA 5 / 20 / 50        EMA 12 / 26       MACD 12-26-9
//! RSI 14 (rolling mean)  Bollinger 20, 2σ  ATR 14   volume / MA20
//! ```

use crate::models::{Candle, IndicatorSummary, Levels, Trend};

pub const SMA_FAST:   usize = 5;
pub const SMA_MEDIUM: usize = 20;
pub const SMA_SLOW:   usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const BB_PERIOD:  usize = 20;
pub const BB_STDDEV:  f64   = 2.0;
pub const LEVEL_LOOKBACK: usize = 20;
/// Bars back used for the medium-SMA slope in trend classification
pub const SLOPE_LOOKBACK: usize = 5;

// ─── Series ───────────────────────────────────────────────────────────────────

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// Recursive EMA, α = 2 / (span + 1), seeded with the first value.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Sample standard deviation (n − 1) over a rolling window.
pub fn rolling_std(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period < 2 || values.len() < period {
        return out;
    }
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let mean   = window.iter().sum::<f64>() / period as f64;
        let var    = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        out[i] = var.sqrt();
    }
    out
}

pub struct Macd {
    pub macd:      Vec<f64>,
    pub signal:    Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(closes: &[f64]) -> Macd {
    let fast = ema(closes, 12);
    let slow = ema(closes, 26);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema(&line, 9);
    let histogram = line.iter().zip(&signal).map(|(m, s)| m - s).collect();
    Macd { macd: line, signal, histogram }
}

/// RSI from simple rolling means of gains and losses.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if closes.len() <= period {
        return out;
    }
    let mut gains  = vec![0.0; closes.len()];
    let mut losses = vec![0.0; closes.len()];
    for i in 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 { gains[i] = delta } else { losses[i] = -delta }
    }
    for i in period..closes.len() {
        let avg_gain = gains[i + 1 - period..=i].iter().sum::<f64>() / period as f64;
        let avg_loss = losses[i + 1 - period..=i].iter().sum::<f64>() / period as f64;
        out[i] = if avg_loss == 0.0 {
            if avg_gain == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
    }
    out
}

/// Average true range, simple mean over `period`.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let tr: Vec<f64> = candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let hl = c.high - c.low;
            match i.checked_sub(1).and_then(|p| candles.get(p)) {
                Some(prev) => hl.max((c.high - prev.close).abs()).max((c.low - prev.close).abs()),
                None => hl,
            }
        })
        .collect();
    sma(&tr, period)
}

// ─── Summary ──────────────────────────────────────────────────────────────────

fn last(series: &[f64]) -> f64 {
    series.last().copied().unwrap_or(f64::NAN)
}

fn replace_nan(v: f64, fallback: f64) -> f64 {
    if v.is_finite() { v } else { fallback }
}

/// Latest-value summary. Caller guarantees at least [`SMA_SLOW`] candles.
pub fn summarize(candles: &[Candle]) -> IndicatorSummary {
    let closes:  Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let price = closes.last().copied().unwrap_or(0.0);

    let bb_mid = sma(&closes, BB_PERIOD);
    let bb_std = rolling_std(&closes, BB_PERIOD);
    let bb_middle = last(&bb_mid);
    let bb_upper  = bb_middle + BB_STDDEV * last(&bb_std);
    let bb_lower  = bb_middle - BB_STDDEV * last(&bb_std);
    let band      = bb_upper - bb_lower;
    let bb_position = if band > 0.0 { (price - bb_lower) / band } else { 0.5 };

    let vol_ma = last(&sma(&volumes, 20));
    let volume_ratio = if vol_ma > 0.0 { volumes.last().copied().unwrap_or(0.0) / vol_ma } else { 1.0 };

    let m = macd(&closes);

    IndicatorSummary {
        sma_fast:       last(&sma(&closes, SMA_FAST)),
        sma_medium:     last(&sma(&closes, SMA_MEDIUM)),
        sma_slow:       last(&sma(&closes, SMA_SLOW)),
        ema_12:         last(&ema(&closes, 12)),
        ema_26:         last(&ema(&closes, 26)),
        macd:           last(&m.macd),
        macd_signal:    last(&m.signal),
        macd_histogram: last(&m.histogram),
        rsi:            replace_nan(last(&rsi(&closes, RSI_PERIOD)), 50.0),
        bb_upper:       replace_nan(bb_upper, price),
        bb_middle:      replace_nan(bb_middle, price),
        bb_lower:       replace_nan(bb_lower, price),
        bb_position:    replace_nan(bb_position, 0.5),
        atr:            replace_nan(last(&atr(candles, ATR_PERIOD)), 0.0),
        volume_ratio:   replace_nan(volume_ratio, 1.0),
    }
}

/// Strong trend needs price above/below the medium SMA, the three SMAs
/// stacked in order, and the medium SMA sloping the same way.
pub fn classify_trend(candles: &[Candle]) -> Trend {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let Some(&price) = closes.last() else { return Trend::Ranging };

    let fast   = last(&sma(&closes, SMA_FAST));
    let medium = sma(&closes, SMA_MEDIUM);
    let slow   = last(&sma(&closes, SMA_SLOW));
    let med_now  = last(&medium);
    let med_prev = medium
        .len()
        .checked_sub(1 + SLOPE_LOOKBACK)
        .and_then(|i| medium.get(i).copied())
        .unwrap_or(f64::NAN);

    if ![fast, slow, med_now, med_prev].iter().all(|v| v.is_finite()) {
        return Trend::Ranging;
    }

    let slope = med_now - med_prev;
    if price > med_now && fast > med_now && med_now > slow && slope > 0.0 {
        Trend::StrongUp
    } else if price < med_now && fast < med_now && med_now < slow && slope < 0.0 {
        Trend::StrongDown
    } else {
        Trend::Ranging
    }
}

/// Static levels from the last 20 bars, dynamic levels from the Bollinger edges.
pub fn levels(candles: &[Candle], summary: &IndicatorSummary) -> Levels {
    let window = &candles[candles.len().saturating_sub(LEVEL_LOOKBACK)..];
    let support    = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    Levels {
        static_support:     if support.is_finite() { support } else { 0.0 },
        static_resistance:  if resistance.is_finite() { resistance } else { 0.0 },
        dynamic_support:    summary.bb_lower,
        dynamic_resistance: summary.bb_upper,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::candles_from_closes;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn sma_aligns_with_input() {
        let s = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert!(s[0].is_nan() && s[1].is_nan());
        assert!(approx(s[2], 2.0));
        assert!(approx(s[4], 4.0));
    }

    #[test]
    fn ema_of_constant_is_constant() {
        let e = ema(&[7.0; 30], 12);
        assert!(e.iter().all(|&v| approx(v, 7.0)));
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert!(approx(*rsi(&up, 14).last().unwrap(), 100.0));

        let down: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(approx(*rsi(&down, 14).last().unwrap(), 0.0));

        let flat = vec![100.0; 30];
        assert!(approx(*rsi(&flat, 14).last().unwrap(), 50.0));
    }

    #[test]
    fn rolling_std_uses_sample_variance() {
        // values 2,4,4,4,5,5,7,9 → sample std = 2.138...
        let s = rolling_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        assert!((s[7] - 2.13808993529939).abs() < 1e-9);
    }

    #[test]
    fn steady_rise_is_strong_up() {
        let closes: Vec<f64> = (0..96).map(|i| 100.0 + i as f64 * 0.5).collect();
        assert_eq!(classify_trend(&candles_from_closes(&closes)), Trend::StrongUp);
    }

    #[test]
    fn steady_fall_is_strong_down() {
        let closes: Vec<f64> = (0..96).map(|i| 200.0 - i as f64 * 0.5).collect();
        assert_eq!(classify_trend(&candles_from_closes(&closes)), Trend::StrongDown);
    }

    #[test]
    fn sideways_is_ranging() {
        let closes: Vec<f64> = (0..96).map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert_eq!(classify_trend(&candles_from_closes(&closes)), Trend::Ranging);
    }

    #[test]
    fn summary_is_finite_and_levels_bracket_price() {
        let closes: Vec<f64> = (0..96).map(|i| 100.0 + (i as f64 / 5.0).sin() * 3.0).collect();
        let candles = candles_from_closes(&closes);
        let s = summarize(&candles);
        assert!(s.rsi >= 0.0 && s.rsi <= 100.0);
        assert!(s.bb_upper >= s.bb_middle && s.bb_middle >= s.bb_lower);
        let l = levels(&candles, &s);
        let price = *closes.last().unwrap();
        assert!(l.static_support <= price && price <= l.static_resistance);
    }
}
