//! # events
//!
//! Defines [`WsEvent`] — ทุก Event ที่ระบบ Broadcast ออกไปผ่าน WebSocket
//! ไปยัง Dashboard (`/ws/monitor`)
//!
//! ใช้ `tokio::sync::broadcast::Sender<String>` โดยแปลง WsEvent เป็น JSON
//! String ก่อนส่ง

use serde::Serialize;

use crate::engine::cycle::CycleReport;
use crate::models::{AuditRecord, Tier, TradeRecord};
use crate::state::RunState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    /// One symbol finished a cycle (any outcome)
    CycleCompleted {
        report: Box<CycleReport>,
    },

    /// Order filled: open / add / reduce / close
    TradeExecuted {
        trade: Box<TradeRecord>,
    },

    /// Trailing tier moved (advance, or reset on close / flip)
    TierChanged {
        model:  String,
        symbol: String,
        from:   Tier,
        to:     Tier,
    },

    /// Audit record flagged `alert`; an operator should look
    Alert {
        record: Box<AuditRecord>,
    },

    RunStateChanged {
        state: RunState,
    },
}

impl WsEvent {
    /// แปลงเป็น JSON String สำหรับส่งผ่าน WebSocket
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_by_event_name() {
        let json = WsEvent::TierChanged {
            model:  "deepseek".into(),
            symbol: "BTC-USDT-SWAP".into(),
            from:   Tier::Low,
            to:     Tier::Tier1,
        }
        .to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["event"], "TIER_CHANGED");
        assert_eq!(v["to"], "TIER1");
        assert_eq!(v["model"], "deepseek");
    }
}
