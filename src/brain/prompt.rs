//! # brain::prompt — สร้าง Prompt สำหรับ AI
//!
//! Context มีขอบเขตจำกัดเสมอ: 20 แท่งล่าสุด, indicator summary,
//! 10 signal ล่าสุด, accuracy ของตัวเอง, position + tier ปัจจุบัน
//! และ market sentiment ถ้ามี feed
//! AI ต้องคืน JSON ที่ `brain::parse` อ่านได้ทันที

use std::fmt::Write as _;

use crate::brain::history::{SignalHistory, ACCURACY_WINDOWS};
use crate::brain::sentiment::SentimentReading;
use crate::models::{MarketSnapshot, Position, TrailingState};

pub const PROMPT_CANDLES: usize = 20;
pub const PROMPT_SIGNALS: usize = 10;

pub struct PromptContext<'a> {
    pub snapshot:     &'a MarketSnapshot,
    pub history:      &'a SignalHistory,
    pub position:     Option<&'a Position>,
    pub trailing:     &'a TrailingState,
    pub sentiment:    Option<&'a SentimentReading>,
    pub leverage_min: u32,
    pub leverage_max: u32,
}

pub fn system_prompt(timeframe: &str) -> String {
    format!(
        "You are a professional cryptocurrency futures trader focusing on {timeframe} trend analysis. \
         You answer with one strict JSON object and nothing else."
    )
}

/// สร้าง Prompt ที่บังคับให้ AI ตอบเป็น JSON ที่ parse ได้
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let s   = ctx.snapshot;
    let ind = &s.indicators;
    let lv  = &s.levels;

    // ── Candles ───────────────────────────────────────────────────────────────
    let mut candles = String::new();
    let start = s.candles.len().saturating_sub(PROMPT_CANDLES);
    for c in &s.candles[start..] {
        let _ = writeln!(
            candles,
            "{} O:{:.4} H:{:.4} L:{:.4} C:{:.4} V:{:.2}",
            c.ts.format("%m-%d %H:%M"), c.open, c.high, c.low, c.close, c.volume
        );
    }

    // ── Signal history ────────────────────────────────────────────────────────
    let mut signals = String::new();
    for e in ctx.history.recent(PROMPT_SIGNALS) {
        let grade = match &e.validation {
            Some(v) if v.correct => format!("✓ ({:+.2}%)", v.change_pct),
            Some(v)              => format!("✗ ({:+.2}%)", v.change_pct),
            None                 => "pending".to_string(),
        };
        let _ = writeln!(
            signals,
            "- {} {} / {} @ {:.4}{} → {}",
            e.signal.timestamp.format("%m-%d %H:%M"),
            e.signal.action,
            e.signal.confidence,
            e.reference_price,
            if e.suppressed { " (suppressed)" } else { "" },
            grade,
        );
    }
    if signals.is_empty() {
        signals.push_str("- none yet\n");
    }

    // ── Accuracy ──────────────────────────────────────────────────────────────
    let mut accuracy = String::new();
    for window in ACCURACY_WINDOWS {
        let acc = ctx.history.accuracy(window);
        let Some(rate) = acc.overall.rate() else { continue };
        let by_action: Vec<String> = acc
            .by_action
            .iter()
            .filter_map(|(k, h)| h.rate().map(|r| format!("{k} {r:.0}% ({}/{})", h.correct, h.total)))
            .collect();
        let by_conf: Vec<String> = acc
            .by_confidence
            .iter()
            .filter_map(|(k, h)| h.rate().map(|r| format!("{k} {r:.0}%")))
            .collect();
        let _ = writeln!(
            accuracy,
            "- last {window}: {rate:.0}% ({}/{}) | {} | {}",
            acc.overall.correct, acc.overall.total, by_action.join(", "), by_conf.join(", ")
        );
    }
    if accuracy.is_empty() {
        accuracy.push_str("- not enough graded signals yet\n");
    }

    // ── Position ──────────────────────────────────────────────────────────────
    let position = match ctx.position {
        Some(p) => format!(
            "{} {:.4} contracts @ {:.4}, {}x {}, profit {:+.2}%, trailing tier {} (peak {:.2}%)",
            p.side,
            p.contracts,
            p.entry_price,
            p.leverage,
            p.margin_mode.as_str(),
            p.profit_pct(s.mark_price()),
            ctx.trailing.tier,
            ctx.trailing.peak_profit_pct,
        ),
        None => "flat (no open position)".to_string(),
    };

    // ── Sentiment ─────────────────────────────────────────────────────────────
    let sentiment = match ctx.sentiment {
        Some(r) => format!(
            "{}{} positive {:.1}% negative {:.1}% net {:+.3} (data {} min old)",
            r.token,
            if r.reference { " (reference)" } else { "" },
            r.positive_ratio * 100.0,
            r.negative_ratio * 100.0,
            r.net_sentiment,
            r.delay_minutes,
        ),
        None => "no data".to_string(),
    };

    let symbol = &s.symbol;
    let tf     = &s.timeframe;
    let lmin   = ctx.leverage_min;
    let lmax   = ctx.leverage_max;

    format!(r#"Analyze {symbol} perpetual swap on the {tf} timeframe.

## Price
- Current: {price:.4} ({chg:+.2}% vs previous close)
- Trend: {trend}

## Recent candles (oldest first)
{candles}
## Indicators
- SMA 5/20/50: {sf:.4} / {sm:.4} / {ss:.4}
- EMA 12/26: {e12:.4} / {e26:.4}
- MACD: {macd:.4} signal {msig:.4} hist {mhist:.4}
- RSI(14): {rsi:.1}
- Bollinger: {bbl:.4} / {bbm:.4} / {bbu:.4} (position {bbp:.2})
- ATR(14): {atr:.4}
- Volume vs 20-bar mean: {vr:.2}x

## Levels
- Static support / resistance: {ssup:.4} / {sres:.4}
- Dynamic support / resistance: {dsup:.4} / {dres:.4}

## Market sentiment
{sentiment}

## Current position
{position}

## Your recent signals
{signals}
## Your accuracy
{accuracy}
## Rules
1. BUY needs stop_loss below the current price, SELL needs stop_loss above it.
2. Leverage must be an integer between {lmin} and {lmax}.
3. Use HOLD when the picture is unclear; do not flip direction without a clear reason.
4. confidence is one of HIGH, MEDIUM, LOW.

Respond with ONLY this JSON object, no markdown:
{{"signal": "BUY|SELL|HOLD", "reason": "<short analysis>", "stop_loss": <price>, "take_profit": <price>, "confidence": "HIGH|MEDIUM|LOW", "leverage": <int>}}"#,
        price = s.price,
        chg   = s.price_change_pct,
        trend = s.trend,
        sf    = ind.sma_fast,
        sm    = ind.sma_medium,
        ss    = ind.sma_slow,
        e12   = ind.ema_12,
        e26   = ind.ema_26,
        macd  = ind.macd,
        msig  = ind.macd_signal,
        mhist = ind.macd_histogram,
        rsi   = ind.rsi,
        bbl   = ind.bb_lower,
        bbm   = ind.bb_middle,
        bbu   = ind.bb_upper,
        bbp   = ind.bb_position,
        atr   = ind.atr,
        vr    = ind.volume_ratio,
        ssup  = lv.static_support,
        sres  = lv.static_resistance,
        dsup  = lv.dynamic_support,
        dres  = lv.dynamic_resistance,
    )
}
