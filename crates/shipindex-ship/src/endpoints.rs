//! Endpoint validation: handshake with every configured node and check it
//! serves the expected chain.

use std::time::Duration;

use futures::future::join_all;
use shipindex_core::{EndpointStatus, IndexerError};
use tracing::{info, warn};

use crate::protocol::{ShipRequest, ShipResult, StatusResult};
use crate::transport::{Frame, ShipConnection, ShipTransport};

/// Probe one endpoint. Never fails; problems are reported in the status.
pub async fn probe_endpoint(
    transport: &dyn ShipTransport,
    url: &str,
    expected_chain_id: Option<&str>,
    timeout: Duration,
) -> EndpointStatus {
    let outcome = match tokio::time::timeout(timeout, fetch_status(transport, url)).await {
        Ok(result) => result,
        Err(_) => Err(IndexerError::Transport(format!("{url}: status timed out"))),
    };

    let mut status = EndpointStatus {
        url: url.to_string(),
        healthy: false,
        chain_id: None,
        head: None,
        last_irreversible: None,
        trace_begin_block: None,
        error: None,
        checked_at: chrono::Utc::now().timestamp(),
    };
    match outcome {
        Ok(s) => {
            status.head = Some(s.head.block_num);
            status.last_irreversible = Some(s.last_irreversible.block_num);
            status.trace_begin_block = Some(s.trace_begin_block);
            status.chain_id = s.chain_id.clone();
            match (expected_chain_id, s.chain_id.as_deref()) {
                (Some(expected), Some(actual)) if expected != actual => {
                    status.error = Some(format!("chain id {actual} does not match {expected}"));
                }
                _ => status.healthy = true,
            }
        }
        Err(e) => status.error = Some(e.to_string()),
    }

    if status.healthy {
        info!(url, head = ?status.head, lib = ?status.last_irreversible, "Endpoint healthy");
    } else {
        warn!(url, error = ?status.error, "Endpoint rejected");
    }
    status
}

/// Probe all endpoints concurrently, in configuration order.
pub async fn validate_endpoints(
    transport: &dyn ShipTransport,
    urls: &[String],
    expected_chain_id: Option<&str>,
    timeout: Duration,
) -> Vec<EndpointStatus> {
    join_all(
        urls.iter()
            .map(|url| probe_endpoint(transport, url, expected_chain_id, timeout)),
    )
    .await
}

/// Urls of the healthy endpoints, in their original order.
pub fn healthy_endpoints(statuses: &[EndpointStatus]) -> Vec<String> {
    statuses.iter().filter(|s| s.healthy).map(|s| s.url.clone()).collect()
}

async fn fetch_status(transport: &dyn ShipTransport, url: &str) -> Result<StatusResult, IndexerError> {
    let mut conn = transport.connect(url).await?;
    let result = status_handshake(conn.as_mut(), url).await;
    conn.close().await;
    result
}

async fn status_handshake(conn: &mut dyn ShipConnection, url: &str) -> Result<StatusResult, IndexerError> {
    match conn.recv().await? {
        Some(Frame::Text(_)) => {}
        _ => return Err(IndexerError::Protocol(format!("{url}: no protocol ABI"))),
    }
    conn.send(ShipRequest::GetStatus.encode()).await?;
    match conn.recv().await? {
        Some(Frame::Binary(frame)) => match ShipResult::decode(&frame)? {
            ShipResult::Status(status) => Ok(status),
            ShipResult::Blocks(_) => Err(IndexerError::Protocol(format!("{url}: expected status"))),
        },
        _ => Err(IndexerError::Protocol(format!("{url}: no status result"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockShip, MOCK_CHAIN_ID};

    #[tokio::test]
    async fn reports_each_endpoint() {
        let ship = MockShip::new(50, 40).unreachable("ws://down");
        let urls = vec!["ws://up".to_string(), "ws://down".to_string()];

        let statuses = validate_endpoints(&ship, &urls, Some(MOCK_CHAIN_ID), Duration::from_secs(1)).await;

        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].healthy);
        assert_eq!(statuses[0].head, Some(50));
        assert_eq!(statuses[0].last_irreversible, Some(40));
        assert!(!statuses[1].healthy);
        assert!(statuses[1].error.as_deref().unwrap().contains("refused"));
        assert_eq!(healthy_endpoints(&statuses), vec!["ws://up".to_string()]);
    }

    #[tokio::test]
    async fn chain_id_mismatch_is_unhealthy() {
        let ship = MockShip::new(5, 5);
        let other = "22".repeat(32);
        let status = probe_endpoint(&ship, "ws://x", Some(other.as_str()), Duration::from_secs(1)).await;
        assert!(!status.healthy);
        assert_eq!(status.chain_id.as_deref(), Some(MOCK_CHAIN_ID));
    }

    #[tokio::test]
    async fn missing_chain_id_is_accepted() {
        let ship = MockShip::new(5, 5).with_chain_id(None);
        let status = probe_endpoint(&ship, "ws://x", Some(MOCK_CHAIN_ID), Duration::from_secs(1)).await;
        assert!(status.healthy);
        assert!(status.chain_id.is_none());
    }
}
