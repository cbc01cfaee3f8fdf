// src/market/events.rs
//
// Typed decoding of market program events from transaction logs.
//
// The program emits Anchor-style events as `Program data: <base64>` log
// lines, each payload prefixed with `sha256("event:<Name>")[..8]`. Only
// lines emitted while the market program itself is executing are accepted;
// data logged by CPI callees or unrelated programs is ignored.

use base64::{engine::general_purpose::STANDARD, Engine};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, warn};

use crate::market::program::{discriminator, DISCRIMINATOR_LEN};
use crate::models::TokenKind;

pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenCreatedEvent {
    pub uuid: String,
    pub internal_id: u64,
    pub market: Pubkey,
    pub owner: Pubkey,
    pub kind: TokenKind,
    pub quadratic_divisor: u64,
    pub freebie_quota: u32,
    pub timestamp: i64,
}

/// A realized buy, sell or freebie claim. Source of truth for what the
/// trade actually cost, independent of any client-side quote.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub uuid: String,
    pub market: Pubkey,
    pub trader: Pubkey,
    pub is_buy: bool,
    pub is_freebie: bool,
    pub amount: u64,
    pub unit_price: u64, // Average realized curve price per unit
    pub total_cost: u64, // Paid by the buyer, or paid out to the seller
    pub creator_fee: u64,
    pub platform_fee: u64,
    pub supply_after: u64,
    pub timestamp: i64,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct FeesDistributedEvent {
    pub uuid: String,
    pub market: Pubkey,
    pub creator_amount: u64,
    pub platform_amount: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    TokenCreated(TokenCreatedEvent),
    Trade(TradeEvent),
    FeesDistributed(FeesDistributedEvent),
    /// Known prefix, unknown or undecodable payload. Kept so callers can
    /// tell "no events" apart from "events we could not read".
    Unrecognized { discriminator: [u8; DISCRIMINATOR_LEN] },
}

/// Realized economics as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedTrade {
    pub is_buy: bool,
    pub is_freebie: bool,
    pub amount: u64,
    pub unit_price: u64,
    pub total_cost: u64,
    pub fees_paid: u64,
    pub supply_after: u64,
}

impl From<&TradeEvent> for RealizedTrade {
    fn from(event: &TradeEvent) -> Self {
        Self {
            is_buy: event.is_buy,
            is_freebie: event.is_freebie,
            amount: event.amount,
            unit_price: event.unit_price,
            total_cost: event.total_cost,
            fees_paid: event.creator_fee.saturating_add(event.platform_fee),
            supply_after: event.supply_after,
        }
    }
}

fn event_name(event: &MarketEvent) -> Option<&'static str> {
    match event {
        MarketEvent::TokenCreated(_) => Some("TokenCreated"),
        MarketEvent::Trade(_) => Some("Trade"),
        MarketEvent::FeesDistributed(_) => Some("FeesDistributed"),
        MarketEvent::Unrecognized { .. } => None,
    }
}

fn deserialize_payload<T: BorshDeserialize>(name: &str, payload: &[u8]) -> Option<T> {
    match T::deserialize(&mut &payload[..]) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("{} discriminator matched but Borsh deserialization failed: {:?}", name, e);
            None
        }
    }
}

/// Decodes one base64 event payload (without the log prefix).
///
/// Returns `None` when the data is not base64 or is shorter than a
/// discriminator, `Unrecognized` when the discriminator is unknown or the
/// payload does not match its layout.
pub fn decode_event(base64_data: &str) -> Option<MarketEvent> {
    let data = match STANDARD.decode(base64_data.trim()) {
        Ok(d) => d,
        Err(e) => {
            debug!("Failed to decode base64 event data: {:?}", e);
            return None;
        }
    };
    if data.len() < DISCRIMINATOR_LEN {
        debug!("Event data too short: {} bytes", data.len());
        return None;
    }

    let mut disc = [0u8; DISCRIMINATOR_LEN];
    disc.copy_from_slice(&data[..DISCRIMINATOR_LEN]);
    let payload = &data[DISCRIMINATOR_LEN..];

    let decoded = if disc == discriminator("event", "Trade") {
        deserialize_payload("Trade", payload).map(MarketEvent::Trade)
    } else if disc == discriminator("event", "TokenCreated") {
        deserialize_payload("TokenCreated", payload).map(MarketEvent::TokenCreated)
    } else if disc == discriminator("event", "FeesDistributed") {
        deserialize_payload("FeesDistributed", payload).map(MarketEvent::FeesDistributed)
    } else {
        None
    };

    Some(decoded.unwrap_or(MarketEvent::Unrecognized { discriminator: disc }))
}

/// Extracts market program events from a transaction's log messages.
pub fn decode_logs(logs: &[String], program_id: &Pubkey) -> Vec<MarketEvent> {
    let program = program_id.to_string();
    let mut call_stack: Vec<&str> = Vec::new();
    let mut events = Vec::new();

    for log in logs {
        if let Some(rest) = log.strip_prefix("Program ") {
            // "Program <id> invoke [n]" / "Program <id> success" / "Program <id> failed: ..."
            let mut parts = rest.splitn(2, ' ');
            let id = parts.next().unwrap_or_default();
            let tail = parts.next().unwrap_or_default();
            if tail.starts_with("invoke [") {
                call_stack.push(id);
                continue;
            }
            if tail == "success" || tail.starts_with("failed") {
                if call_stack.last() == Some(&id) {
                    call_stack.pop();
                }
                continue;
            }
        }

        let Some(data) = log.strip_prefix(PROGRAM_DATA_PREFIX) else {
            continue;
        };
        if call_stack.last() != Some(&program.as_str()) {
            continue;
        }
        if let Some(event) = decode_event(data) {
            events.push(event);
        }
    }

    events
}

/// First trade event for `uuid`, optionally restricted to one trader.
pub fn find_trade<'a>(events: &'a [MarketEvent], uuid: &str, trader: Option<&Pubkey>) -> Option<&'a TradeEvent> {
    events.iter().find_map(|event| match event {
        MarketEvent::Trade(trade) if trade.uuid == uuid && trader.map_or(true, |t| &trade.trader == t) => Some(trade),
        _ => None,
    })
}

pub fn find_created<'a>(events: &'a [MarketEvent], uuid: &str) -> Option<&'a TokenCreatedEvent> {
    events.iter().find_map(|event| match event {
        MarketEvent::TokenCreated(created) if created.uuid == uuid => Some(created),
        _ => None,
    })
}

pub fn find_fees_distributed<'a>(events: &'a [MarketEvent], uuid: &str) -> Option<&'a FeesDistributedEvent> {
    events.iter().find_map(|event| match event {
        MarketEvent::FeesDistributed(fees) if fees.uuid == uuid => Some(fees),
        _ => None,
    })
}

/// Encodes an event as the program would log it. `Unrecognized` yields an
/// empty payload behind its discriminator.
pub fn encode_event(event: &MarketEvent) -> String {
    let (disc, payload) = match event {
        MarketEvent::TokenCreated(e) => (discriminator("event", "TokenCreated"), e.try_to_vec()),
        MarketEvent::Trade(e) => (discriminator("event", "Trade"), e.try_to_vec()),
        MarketEvent::FeesDistributed(e) => (discriminator("event", "FeesDistributed"), e.try_to_vec()),
        MarketEvent::Unrecognized { discriminator } => (*discriminator, Ok(Vec::new())),
    };
    let mut data = disc.to_vec();
    data.extend(payload.unwrap_or_default());
    format!("{}{}", PROGRAM_DATA_PREFIX, STANDARD.encode(data))
}

/// Log lines for a successful top-level invocation emitting `events`.
pub fn program_logs(program_id: &Pubkey, events: &[MarketEvent]) -> Vec<String> {
    let mut logs = vec![format!("Program {} invoke [1]", program_id)];
    for event in events {
        if let Some(name) = event_name(event) {
            logs.push(format!("Program log: Instruction emitted {}", name));
        }
        logs.push(encode_event(event));
    }
    logs.push(format!("Program {} success", program_id));
    logs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(uuid: &str, trader: Pubkey) -> TradeEvent {
        TradeEvent {
            uuid: uuid.to_string(),
            market: Pubkey::new_unique(),
            trader,
            is_buy: true,
            is_freebie: false,
            amount: 5,
            unit_price: 106_000,
            total_cost: 525_000,
            creator_fee: 7_500,
            platform_fee: 7_500,
            supply_after: 5,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_decode_trade_from_program_logs() {
        let program_id = Pubkey::new_unique();
        let trader = Pubkey::new_unique();
        let trade = sample_trade("creator-1", trader);
        let logs = program_logs(&program_id, &[MarketEvent::Trade(trade.clone())]);

        let events = decode_logs(&logs, &program_id);
        assert_eq!(events, vec![MarketEvent::Trade(trade.clone())]);
        assert_eq!(find_trade(&events, "creator-1", Some(&trader)), Some(&trade));
        assert!(find_trade(&events, "creator-2", None).is_none());
        assert!(find_trade(&events, "creator-1", Some(&Pubkey::new_unique())).is_none());
    }

    #[test]
    fn test_ignores_data_from_other_programs() {
        let program_id = Pubkey::new_unique();
        let impostor = Pubkey::new_unique();
        let trade = sample_trade("creator-1", Pubkey::new_unique());
        let logs = program_logs(&impostor, &[MarketEvent::Trade(trade)]);
        assert!(decode_logs(&logs, &program_id).is_empty());
    }

    #[test]
    fn test_cpi_callee_data_is_skipped() {
        let program_id = Pubkey::new_unique();
        let token_program = spl_token::id();
        let trade = sample_trade("creator-1", Pubkey::new_unique());
        let mut logs = vec![
            format!("Program {} invoke [1]", program_id),
            format!("Program {} invoke [2]", token_program),
            encode_event(&MarketEvent::Trade(trade.clone())),
            format!("Program {} success", token_program),
        ];
        assert!(decode_logs(&logs, &program_id).is_empty());

        logs.push(encode_event(&MarketEvent::Trade(trade.clone())));
        logs.push(format!("Program {} success", program_id));
        assert_eq!(decode_logs(&logs, &program_id), vec![MarketEvent::Trade(trade)]);
    }

    #[test]
    fn test_unknown_discriminator_is_unrecognized() {
        let program_id = Pubkey::new_unique();
        let unknown = MarketEvent::Unrecognized { discriminator: [9u8; 8] };
        let logs = program_logs(&program_id, &[unknown.clone()]);
        let events = decode_logs(&logs, &program_id);
        assert_eq!(events, vec![unknown]);
        assert!(find_trade(&events, "creator-1", None).is_none());
    }

    #[test]
    fn test_truncated_payload_is_unrecognized() {
        let mut data = discriminator("event", "Trade").to_vec();
        data.extend([1, 2, 3]);
        let event = decode_event(&STANDARD.encode(data));
        assert!(matches!(event, Some(MarketEvent::Unrecognized { .. })));
    }

    #[test]
    fn test_garbage_is_skipped() {
        assert!(decode_event("not base64!!").is_none());
        assert!(decode_event(&STANDARD.encode([1, 2])).is_none());
    }

    #[test]
    fn test_realized_trade_sums_fees() {
        let trade = sample_trade("creator-1", Pubkey::new_unique());
        let realized = RealizedTrade::from(&trade);
        assert_eq!(realized.fees_paid, 15_000);
        assert_eq!(realized.total_cost, 525_000);
    }
}
