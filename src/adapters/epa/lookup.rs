//! ePA account lookup
//!
//! Before exporting, the processor needs to know which backend holds the
//! insurant's record and whether the medication service may receive data.
//! [`HttpAccountLookup`] asks the information service of each configured host
//! in turn.

use crate::config::EpaConfig;
use crate::domain::{EpaAccount, ExporterError, Kvnr, LookupCode, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;

const CONSENT_DECISIONS_PATH: &str = "/information/api/v1/ehr/consentdecisions";
const MEDICATION_FUNCTION: &str = "medication";

/// Resolves where a KVNR's record lives
#[async_trait]
pub trait AccountLookup: Send + Sync {
    /// Looks up the account; failures are reported as [`LookupCode::Unknown`]
    async fn lookup(&self, kvnr: &Kvnr) -> EpaAccount;
}

#[derive(Debug, Deserialize)]
struct ConsentDecisions {
    #[serde(default)]
    data: Vec<ConsentDecision>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentDecision {
    function_id: String,
    decision: String,
}

/// Consent decision lookup over plain HTTPS
pub struct HttpAccountLookup {
    client: Client,
    scheme: String,
    hosts: Vec<(String, u16)>,
}

impl HttpAccountLookup {
    /// Builds a lookup over every host of the ePA configuration
    pub fn new(config: &EpaConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(|h| (h.host.clone(), h.port))
            .collect();
        let client = ClientBuilder::new()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                ExporterError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            scheme: config.scheme.clone(),
            hosts,
        })
    }

    async fn query_host(&self, host: &str, port: u16, kvnr: &Kvnr) -> LookupCode {
        let url = format!("{}://{}:{}{}", self.scheme, host, port, CONSENT_DECISIONS_PATH);
        let response = match self
            .client
            .get(&url)
            .header("x-insurantid", kvnr.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Account lookup request failed");
                return LookupCode::Unknown;
            }
        };

        match response.status() {
            StatusCode::OK => match response.json::<ConsentDecisions>().await {
                Ok(decisions) => {
                    let permitted = decisions.data.iter().any(|d| {
                        d.function_id == MEDICATION_FUNCTION && d.decision == "permit"
                    });
                    if permitted {
                        LookupCode::Allowed
                    } else {
                        LookupCode::Deny
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Malformed consent decisions");
                    LookupCode::Unknown
                }
            },
            StatusCode::NOT_FOUND => LookupCode::NotFound,
            StatusCode::CONFLICT => LookupCode::Conflict,
            status => {
                tracing::warn!(host = %host, status = status.as_u16(), "Unexpected account lookup status");
                LookupCode::Unknown
            }
        }
    }
}

#[async_trait]
impl AccountLookup for HttpAccountLookup {
    async fn lookup(&self, kvnr: &Kvnr) -> EpaAccount {
        let mut saw_unknown = false;
        for (host, port) in &self.hosts {
            match self.query_host(host, *port, kvnr).await {
                LookupCode::NotFound => continue,
                LookupCode::Unknown => saw_unknown = true,
                code => return EpaAccount::routed(code, host.clone(), *port),
            }
        }
        if saw_unknown {
            EpaAccount::unrouted(LookupCode::Unknown)
        } else {
            EpaAccount::unrouted(LookupCode::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpaHostConfig;

    fn config_for(servers: &[&mockito::ServerGuard]) -> EpaConfig {
        let hosts = servers
            .iter()
            .map(|server| {
                let address = server.socket_address();
                EpaHostConfig {
                    host: address.ip().to_string(),
                    port: address.port(),
                    connection_count: 1,
                }
            })
            .collect();
        let mut config: EpaConfig = toml::from_str("hosts = []").unwrap();
        config.hosts = hosts;
        config.scheme = "http".to_string();
        config
    }

    fn kvnr() -> Kvnr {
        Kvnr::new("X123456789").unwrap()
    }

    #[tokio::test]
    async fn test_permit_is_allowed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", CONSENT_DECISIONS_PATH)
            .match_header("x-insurantid", "X123456789")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"functionId":"medication","decision":"permit"}]}"#)
            .create_async()
            .await;

        let lookup = HttpAccountLookup::new(&config_for(&[&server])).unwrap();
        let account = lookup.lookup(&kvnr()).await;

        mock.assert_async().await;
        assert_eq!(account.code, LookupCode::Allowed);
        assert_eq!(account.port, server.socket_address().port());
    }

    #[tokio::test]
    async fn test_deny_decision() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", CONSENT_DECISIONS_PATH)
            .with_status(200)
            .with_body(r#"{"data":[{"functionId":"medication","decision":"deny"}]}"#)
            .create_async()
            .await;

        let lookup = HttpAccountLookup::new(&config_for(&[&server])).unwrap();
        assert_eq!(lookup.lookup(&kvnr()).await.code, LookupCode::Deny);
    }

    #[tokio::test]
    async fn test_not_found_falls_through_to_next_host() {
        let mut first = mockito::Server::new_async().await;
        let mut second = mockito::Server::new_async().await;
        first
            .mock("GET", CONSENT_DECISIONS_PATH)
            .with_status(404)
            .create_async()
            .await;
        second
            .mock("GET", CONSENT_DECISIONS_PATH)
            .with_status(409)
            .create_async()
            .await;

        let lookup = HttpAccountLookup::new(&config_for(&[&first, &second])).unwrap();
        let account = lookup.lookup(&kvnr()).await;
        assert_eq!(account.code, LookupCode::Conflict);
        assert_eq!(account.port, second.socket_address().port());
    }

    #[tokio::test]
    async fn test_all_hosts_not_found() {
        let mut first = mockito::Server::new_async().await;
        let mut second = mockito::Server::new_async().await;
        for server in [&mut first, &mut second] {
            server
                .mock("GET", CONSENT_DECISIONS_PATH)
                .with_status(404)
                .create_async()
                .await;
        }

        let lookup = HttpAccountLookup::new(&config_for(&[&first, &second])).unwrap();
        assert_eq!(lookup.lookup(&kvnr()).await.code, LookupCode::NotFound);
    }

    #[tokio::test]
    async fn test_server_error_is_unknown() {
        let mut first = mockito::Server::new_async().await;
        let mut second = mockito::Server::new_async().await;
        first
            .mock("GET", CONSENT_DECISIONS_PATH)
            .with_status(503)
            .create_async()
            .await;
        second
            .mock("GET", CONSENT_DECISIONS_PATH)
            .with_status(404)
            .create_async()
            .await;

        let lookup = HttpAccountLookup::new(&config_for(&[&first, &second])).unwrap();
        assert_eq!(lookup.lookup(&kvnr()).await.code, LookupCode::Unknown);
    }
}
