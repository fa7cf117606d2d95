//! # config — อ่าน Config จาก Environment Variables
//!
//! `Config::from_env()` reads the process environment (after `.env` is
//! loaded by `main`). Tests build the same thing from a map through
//! [`Env::from_pairs`] so they never touch global state.
//!
//! ## Per-symbol overrides
//! Any per-symbol key can be overridden as `KEY_<SYMBOL>` where the symbol is
//! upper-cased and `-` becomes `_`:
//!
//! ```text
//! MIN_TRADE_INCREMENT=0.01
//! MIN_TRADE_INCREMENT_BTC_USDT_SWAP=0.001
//! ```
//!
//! ## Models
//! `ENABLED_MODELS=deepseek,qwen` รันหลาย model คู่กัน แต่ละตัวมี pipeline
//! ของตัวเองต่อ symbol. AI และ OKX keys อ่านแบบ `KEY_<MODEL>` ก่อน แล้วค่อย
//! fall back ไปที่ `KEY`:
//!
//! ```text
//! AI_PROVIDER_QWEN=openai
//! AI_BASE_URL_QWEN=https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions
//! OKX_API_KEY_QWEN=...        # sub-account ของ qwen
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::brain::ai::{AiConfig, AiProvider};
use crate::brain::filter::FilterConfig;
use crate::brain::sentiment::SentimentConfig;
use crate::engine::liquidity::LiquidityConfig;
use crate::engine::scheduler::SchedulerConfig;
use crate::engine::sizing::SizingConfig;
use crate::engine::trailing::TrailingConfig;
use crate::exchange::ExchangeConfig;
use crate::models::MarginMode;
use crate::retry::RetryPolicy;

// ─── Env Lookup ───────────────────────────────────────────────────────────────

/// Key → value source. Process env in production, a map in tests.
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    pub fn process() -> Self {
        Self { vars: std::env::vars().collect() }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    /// View where every `KEY_<SCOPE>` shadows `KEY`.
    pub fn scoped(&self, scope: &str) -> Env {
        let tail = format!("_{}", scope_suffix(scope));
        let mut vars = self.vars.clone();
        for (key, value) in &self.vars {
            if value.trim().is_empty() {
                continue;
            }
            if let Some(base) = key.strip_suffix(&tail) {
                vars.insert(base.to_string(), value.clone());
            }
        }
        Env { vars }
    }

    fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Raw value; empty strings count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).filter(|v| !v.trim().is_empty()).map(|v| v.trim().to_string())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
            None => Ok(default),
        }
    }

    pub fn required<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(key).with_context(|| format!("{key} environment variable is required"))?;
        raw.parse().map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}"))
    }

    pub fn secs_or(&self, key: &str, default: u64) -> anyhow::Result<Duration> {
        Ok(Duration::from_secs(self.parse_or(key, default)?))
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(default)
    }

    /// `KEY_<SYMBOL>` first, then `KEY`.
    pub fn for_symbol(&self, key: &str, symbol: &str) -> Option<String> {
        self.get(&symbol_key(key, symbol)).or_else(|| self.get(key))
    }

    fn symbol_parse<T>(&self, key: &str, symbol: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.for_symbol(key, symbol) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{key} for {symbol} = {raw:?} is invalid: {e}")),
            None => Ok(None),
        }
    }
}

fn scope_suffix(scope: &str) -> String {
    scope.to_ascii_uppercase().replace('-', "_")
}

fn symbol_key(key: &str, symbol: &str) -> String {
    format!("{key}_{}", scope_suffix(symbol))
}

// ─── Per-Model ────────────────────────────────────────────────────────────────

/// One `ENABLED_MODELS` entry: its own inference endpoint and exchange
/// account. Each model trades every configured symbol independently.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Lower-case lane name, e.g. `deepseek`
    pub name:     String,
    pub ai:       AiConfig,
    pub exchange: ExchangeConfig,
}

impl ModelConfig {
    fn from_env(env: &Env, name: &str) -> anyhow::Result<Self> {
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            bail!("ENABLED_MODELS entry '{name}' may only contain letters, digits, '-' and '_'");
        }
        let mut scoped = env.scoped(name);
        // a model named after a provider talks to that provider unless told otherwise
        if scoped.get("AI_PROVIDER").is_none() && name.parse::<AiProvider>().is_ok() {
            scoped = scoped.with("AI_PROVIDER", name);
        }

        let exchange = ExchangeConfig::from_env(&scoped)
            .with_context(|| format!("exchange settings for model '{name}'"))?;
        let ai = AiConfig::from_env(&scoped, exchange.mode.is_paper())
            .with_context(|| format!("AI settings for model '{name}'"))?;
        Ok(Self { name: name.to_string(), ai, exchange })
    }
}

// ─── Per-Symbol ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SymbolConfig {
    /// Exchange instrument id, e.g. `BTC-USDT-SWAP`
    pub symbol:           String,
    /// Smallest tradable contract step
    pub min_increment:    f64,
    /// Base notional (USDT) before multipliers
    pub base_notional:    f64,
    pub default_leverage: u32,
    pub margin_mode:      MarginMode,
    pub liquidity:        LiquidityConfig,
}

impl SymbolConfig {
    fn from_env(env: &Env, symbol: &str, sizing: &SizingConfig) -> anyhow::Result<Self> {
        let min_increment: f64 = env
            .symbol_parse("MIN_TRADE_INCREMENT", symbol)?
            .with_context(|| format!("MIN_TRADE_INCREMENT is required (missing for {symbol})"))?;
        if !(min_increment > 0.0) {
            bail!("MIN_TRADE_INCREMENT for {symbol} must be > 0");
        }

        let default_leverage = env.symbol_parse("LEVERAGE_DEFAULT", symbol)?.unwrap_or(10u32);
        if default_leverage < sizing.leverage_min || default_leverage > sizing.leverage_max {
            bail!(
                "LEVERAGE_DEFAULT for {symbol} ({default_leverage}) outside [{}, {}]",
                sizing.leverage_min, sizing.leverage_max
            );
        }

        let margin_mode = match env.for_symbol("MARGIN_MODE", symbol) {
            Some(raw) => raw.parse::<MarginMode>().map_err(anyhow::Error::msg)?,
            None => MarginMode::Cross,
        };

        Ok(Self {
            symbol: symbol.to_string(),
            min_increment,
            base_notional: env.symbol_parse("BASE_NOTIONAL_USDT", symbol)?.unwrap_or(100.0),
            default_leverage,
            margin_mode,
            liquidity: LiquidityConfig::from_env(env, symbol)?,
        })
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub symbols:      Vec<SymbolConfig>,
    /// At least one; pipelines run per `(model, symbol)`
    pub models:       Vec<ModelConfig>,
    /// Candle bar, e.g. "5m"
    pub timeframe:    String,
    pub candle_count: usize,
    pub sentiment:    Option<SentimentConfig>,
    pub sizing:       SizingConfig,
    pub trailing:     TrailingConfig,
    pub filter:       FilterConfig,
    pub scheduler:    SchedulerConfig,
    pub retry:        RetryPolicy,
    /// Max entries kept in each symbol's signal history
    pub history_cap:  usize,
    pub database_url: String,
    pub bind_addr:    String,
    /// `X-API-Key` required by the status surface; unset = open
    pub api_key:      Option<String>,
    /// Boot with cycles skipped until an operator resumes (SIGUSR2)
    pub start_paused: bool,
}

/// Slow SMA needs 50 bars; a little slack on top for the slope check.
pub const MIN_CANDLES: usize = 60;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&Env::process())
    }

    pub fn from_lookup(env: &Env) -> anyhow::Result<Self> {
        let symbol_names: Vec<String> = env
            .string_or("SYMBOLS", "BTC-USDT-SWAP")
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbol_names.is_empty() {
            bail!("SYMBOLS must list at least one instrument");
        }

        let candle_count: usize = env.parse_or("CANDLE_COUNT", 96)?;
        if candle_count < MIN_CANDLES {
            bail!("CANDLE_COUNT must be >= {MIN_CANDLES} (got {candle_count})");
        }

        let mut model_names: Vec<String> = Vec::new();
        for name in env.string_or("ENABLED_MODELS", "deepseek").split(',') {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !model_names.contains(&name) {
                model_names.push(name);
            }
        }
        if model_names.is_empty() {
            bail!("ENABLED_MODELS must list at least one model");
        }
        let models = model_names
            .iter()
            .map(|name| ModelConfig::from_env(env, name))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let trailing = TrailingConfig::from_env(env)?;
        let sizing   = SizingConfig::from_env(env, trailing.hard_stop_pct)?;
        let scheduler = SchedulerConfig::from_env(env)?;
        let filter    = FilterConfig::from_env(env, scheduler.interval)?;

        let symbols = symbol_names
            .iter()
            .map(|s| SymbolConfig::from_env(env, s, &sizing))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            symbols,
            models,
            timeframe:    env.string_or("TIMEFRAME", "5m"),
            candle_count,
            sentiment:    SentimentConfig::from_env(env)?,
            sizing,
            trailing,
            filter,
            scheduler,
            retry:        RetryPolicy::from_env(env)?,
            history_cap:  env.parse_or("SIGNAL_HISTORY_CAP", 50)?,
            database_url: env.string_or("DATABASE_URL", "sqlite://perpguard.db"),
            bind_addr:    env.string_or("BIND_ADDR", "0.0.0.0:3000"),
            api_key:      env.get("API_KEY"),
            start_paused: env.flag("START_PAUSED", false),
        })
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }
}
