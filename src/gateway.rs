use crate::document::{parse_envelope, BalanceDocument};
use crate::error::{MarginError, Result};
use crate::request::{QueryRequest, SOAP_CONTENT_TYPE};
use crate::schema::GatewayConfig;
use crate::source::BalanceSource;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

/// Balance inquiries against the Dealernet `CONSULTASALDOCONTABIL` operation.
#[derive(Clone)]
pub struct DealernetGateway {
    client: Client,
    config: GatewayConfig,
}

impl DealernetGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MarginError::Transport {
                endpoint: config.endpoint.clone(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn transport_error(&self, e: reqwest::Error) -> MarginError {
        if e.is_timeout() {
            MarginError::Timeout(self.config.timeout())
        } else {
            MarginError::Transport {
                endpoint: self.config.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl BalanceSource for DealernetGateway {
    async fn fetch_balance(&self, query: &QueryRequest) -> Result<BalanceDocument> {
        debug!("Requesting balances for {}", query.label());

        let res = self
            .client
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(query.to_soap_envelope(&self.config))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(MarginError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = res.bytes().await.map_err(|e| self.transport_error(e))?;
        let document = parse_envelope(&bytes)?;

        info!(
            "Received {} account balances for {}",
            document.len(),
            query.label()
        );
        Ok(document)
    }
}
