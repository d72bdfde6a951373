use crate::document::{parse_envelope, BalanceDocument};
use crate::error::{MarginError, Result};
use crate::request::QueryRequest;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;

/// Anything that can answer a balance inquiry for one branch and month.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balance(&self, query: &QueryRequest) -> Result<BalanceDocument>;
}

#[async_trait]
impl<S: BalanceSource + ?Sized> BalanceSource for std::sync::Arc<S> {
    async fn fetch_balance(&self, query: &QueryRequest) -> Result<BalanceDocument> {
        (**self).fetch_balance(query).await
    }
}

/// Runs `fetch_balance` under a deadline; expiry yields `MarginError::Timeout`.
pub async fn fetch_with_timeout<S: BalanceSource + ?Sized>(
    source: &S,
    query: &QueryRequest,
    limit: Duration,
) -> Result<BalanceDocument> {
    match tokio::time::timeout(limit, source.fetch_balance(query)).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Balance request {} exceeded {:?}", query.label(), limit);
            Err(MarginError::Timeout(limit))
        }
    }
}

#[derive(Debug, Clone)]
enum Recorded {
    Envelope(Vec<u8>),
    Document(BalanceDocument),
}

/// Serves previously captured gateway responses, keyed by (year, month, branch).
/// Useful for replaying an export offline.
#[derive(Debug, Clone, Default)]
pub struct RecordedBalanceSource {
    responses: HashMap<(i32, u32, u32), Recorded>,
}

impl RecordedBalanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_envelope(&mut self, year: i32, month: u32, branch: u32, envelope: impl Into<Vec<u8>>) {
        self.responses
            .insert((year, month, branch), Recorded::Envelope(envelope.into()));
    }

    pub fn insert_document(&mut self, year: i32, month: u32, branch: u32, document: BalanceDocument) {
        self.responses
            .insert((year, month, branch), Recorded::Document(document));
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[async_trait]
impl BalanceSource for RecordedBalanceSource {
    async fn fetch_balance(&self, query: &QueryRequest) -> Result<BalanceDocument> {
        match self.responses.get(&(query.year, query.month, query.branch)) {
            Some(Recorded::Envelope(bytes)) => parse_envelope(bytes),
            Some(Recorded::Document(document)) => Ok(document.clone()),
            None => Err(MarginError::MissingPayload(format!(
                "No recorded response for {}",
                query.label()
            ))),
        }
    }
}
