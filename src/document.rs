//! Parsing of the Dealernet balance export.
//!
//! The gateway answers with a SOAP envelope whose `Xml_retorno` element carries a
//! second, string-encoded XML document. That inner document holds one
//! `SDT_SaldoContabilItem` per ledger account:
//!
//! ```xml
//! <SDT_SaldoContabil>
//!   <SDT_SaldoContabilItem>
//!     <ContaIDNivel>3.1.1.001.000001</ContaIDNivel>
//!     <SaldoInicial>-1500.00</SaldoInicial>
//!     <SaldoFinal>-2750.35</SaldoFinal>
//!   </SDT_SaldoContabilItem>
//! </SDT_SaldoContabil>
//! ```

use crate::error::{MarginError, Result};
use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

const ITEM_TAG: &[u8] = b"SDT_SaldoContabilItem";
const ACCOUNT_TAG: &[u8] = b"ContaIDNivel";
const OPENING_TAG: &[u8] = b"SaldoInicial";
const CLOSING_TAG: &[u8] = b"SaldoFinal";
const PAYLOAD_TAG: &[u8] = b"Xml_retorno";
const FAULT_TAG: &[u8] = b"faultstring";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: String,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
}

impl AccountBalance {
    pub fn new(account_id: impl Into<String>, opening_balance: Decimal, closing_balance: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            opening_balance,
            closing_balance,
        }
    }

    /// Movement over the period, rounded half-to-even to cents.
    ///
    /// Balances of opposite sign near the `Decimal` limits have no representable
    /// movement; that is reported as a `Parse` error.
    pub fn delta(&self) -> Result<Decimal> {
        self.closing_balance
            .checked_sub(self.opening_balance)
            .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven))
            .ok_or_else(|| {
                MarginError::Parse(format!(
                    "Account {} has an out-of-range movement ({} to {})",
                    self.account_id, self.opening_balance, self.closing_balance
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    balance: AccountBalance,
    delta: Decimal,
}

/// Balances of one (month, year, branch) export, keyed by account path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceDocument {
    entries: BTreeMap<String, Entry>,
}

impl BalanceDocument {
    /// Builds a document from already-parsed balances.
    /// Fails if the same account appears twice or a movement is out of range.
    pub fn from_balances(balances: impl IntoIterator<Item = AccountBalance>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for balance in balances {
            if entries.contains_key(&balance.account_id) {
                return Err(MarginError::Parse(format!(
                    "Account {} appears more than once",
                    balance.account_id
                )));
            }
            let delta = balance.delta()?;
            entries.insert(balance.account_id.clone(), Entry { balance, delta });
        }
        Ok(Self { entries })
    }

    /// Parses the inner balance document (the decoded content of `Xml_retorno`).
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut items = Vec::new();
        let mut pending: Option<PendingItem> = None;
        let mut field: Option<Field> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    ITEM_TAG => {
                        if pending.is_some() {
                            return Err(MarginError::Parse(
                                "Nested SDT_SaldoContabilItem element".to_string(),
                            ));
                        }
                        pending = Some(PendingItem::new(items.len()));
                    }
                    name if pending.is_some() => {
                        field = Field::from_tag(name);
                        if let (Some(f), Some(item)) = (field, pending.as_mut()) {
                            item.set(f, String::new());
                        }
                    }
                    _ => {}
                },
                Ok(Event::Empty(e)) => {
                    if let (Some(f), Some(item)) =
                        (Field::from_tag(e.local_name().as_ref()), pending.as_mut())
                    {
                        item.set(f, String::new());
                    }
                }
                Ok(Event::Text(t)) => {
                    if let (Some(f), Some(item)) = (field, pending.as_mut()) {
                        let text = t.unescape().map_err(|e| MarginError::Parse(e.to_string()))?;
                        item.append(f, &text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let (Some(f), Some(item)) = (field, pending.as_mut()) {
                        let text = std::str::from_utf8(&c)
                            .map_err(|e| MarginError::Parse(e.to_string()))?;
                        item.append(f, text);
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    ITEM_TAG => {
                        if let Some(item) = pending.take() {
                            items.push(item.finish()?);
                        }
                        field = None;
                    }
                    name if Field::from_tag(name).is_some() => field = None,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(MarginError::Parse(format!(
                        "Invalid XML at position {}: {}",
                        reader.error_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if pending.is_some() {
            return Err(MarginError::Parse(
                "Unterminated SDT_SaldoContabilItem element".to_string(),
            ));
        }
        if items.is_empty() {
            return Err(MarginError::Parse(
                "No SDT_SaldoContabilItem records found".to_string(),
            ));
        }

        debug!("Parsed balance document with {} accounts", items.len());
        Self::from_balances(items)
    }

    /// Delta of `account_id` over the period, or `None` when the export has no
    /// entry for it (accounts without activity may be omitted).
    pub fn lookup(&self, account_id: &str) -> Option<Decimal> {
        self.entries.get(account_id).map(|entry| entry.delta)
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountBalance> {
        self.entries.get(account_id).map(|entry| &entry.balance)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountBalance> {
        self.entries.values().map(|entry| &entry.balance)
    }
}

/// Extracts `Xml_retorno` from a gateway response envelope and parses it.
pub fn parse_envelope(envelope: &[u8]) -> Result<BalanceDocument> {
    let payload = extract_payload(envelope)?;
    BalanceDocument::parse(payload.trim())
}

/// Returns the decoded text of the `Xml_retorno` element.
pub fn extract_payload(envelope: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(envelope);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_payload = false;
    let mut in_fault = false;
    let mut payload: Option<String> = None;
    let mut fault: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                PAYLOAD_TAG => {
                    in_payload = true;
                    payload.get_or_insert_with(String::new);
                }
                FAULT_TAG => in_fault = true,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| MarginError::MissingPayload(format!("Undecodable envelope text: {}", e)))?;
                if in_payload {
                    payload.get_or_insert_with(String::new).push_str(&text);
                } else if in_fault {
                    fault.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if in_payload {
                    let text = std::str::from_utf8(&c).map_err(|e| {
                        MarginError::MissingPayload(format!("Payload is not UTF-8: {}", e))
                    })?;
                    payload.get_or_insert_with(String::new).push_str(text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                PAYLOAD_TAG => in_payload = false,
                FAULT_TAG => in_fault = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(MarginError::MissingPayload(format!(
                    "Response envelope is not well-formed XML: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(reason) = fault {
        return Err(MarginError::MissingPayload(format!("SOAP fault: {}", reason)));
    }

    match payload {
        Some(text) if !text.trim().is_empty() => Ok(text),
        Some(_) => Err(MarginError::MissingPayload("Xml_retorno is empty".to_string())),
        None => Err(MarginError::MissingPayload(
            "Response has no Xml_retorno element".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Account,
    Opening,
    Closing,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            ACCOUNT_TAG => Some(Self::Account),
            OPENING_TAG => Some(Self::Opening),
            CLOSING_TAG => Some(Self::Closing),
            _ => None,
        }
    }
}

struct PendingItem {
    index: usize,
    account: Option<String>,
    opening: Option<String>,
    closing: Option<String>,
}

impl PendingItem {
    fn new(index: usize) -> Self {
        Self {
            index,
            account: None,
            opening: None,
            closing: None,
        }
    }

    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Account => &mut self.account,
            Field::Opening => &mut self.opening,
            Field::Closing => &mut self.closing,
        }
    }

    fn set(&mut self, field: Field, value: String) {
        *self.slot(field) = Some(value);
    }

    fn append(&mut self, field: Field, text: &str) {
        self.slot(field).get_or_insert_with(String::new).push_str(text);
    }

    fn finish(self) -> Result<AccountBalance> {
        let index = self.index;
        let account_id = self
            .account
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                MarginError::Parse(format!("Balance item #{} has no ContaIDNivel", index))
            })?;

        let opening_balance = parse_amount(self.opening, "SaldoInicial", &account_id)?;
        let closing_balance = parse_amount(self.closing, "SaldoFinal", &account_id)?;

        Ok(AccountBalance {
            account_id,
            opening_balance,
            closing_balance,
        })
    }
}

fn parse_amount(raw: Option<String>, tag: &str, account_id: &str) -> Result<Decimal> {
    let raw = raw.ok_or_else(|| {
        MarginError::Parse(format!("Account {} has no {}", account_id, tag))
    })?;
    let trimmed = raw.trim();

    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| {
            MarginError::Parse(format!(
                "Account {} has a non-numeric {}: '{}'",
                account_id, tag, trimmed
            ))
        })
}
