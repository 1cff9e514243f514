//! Path-level retry loop.
//!
//! [`SessionNetwork`] is the seam between routing and request semantics:
//! it picks a path, dispatches through the transport, feeds every failure
//! to the classifier and retries with a fresh path until the request
//! succeeds, a terminal failure is classified, or the attempt budget runs
//! out. It never inspects or rebuilds payloads — clock-skew failures are
//! surfaced as [`Error::ClockOutOfSync`] so the layer that signed the
//! request can resync and rebuild it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::network::classify::{Decision, FailureHandler};
use crate::onion::{OnionDestination, OnionResponse, OnionTransport, OnionVersion, PathManager};

/// Fresh-path attempts before a request is declared unreachable.
pub const MAX_PATH_ATTEMPTS: u32 = 8;

/// Dispatches onion requests with path rotation and failure-driven retry.
pub struct SessionNetwork {
    paths: Arc<PathManager>,
    transport: Arc<dyn OnionTransport>,
    handler: Arc<FailureHandler>,
}

impl SessionNetwork {
    /// Create a network over the shared services.
    pub fn new(
        paths: Arc<PathManager>,
        transport: Arc<dyn OnionTransport>,
        handler: Arc<FailureHandler>,
    ) -> Self {
        Self {
            paths,
            transport,
            handler,
        }
    }

    /// Send `payload` to `destination`, retrying across paths.
    ///
    /// `swarm_pubkey` names the account whose swarm the request targets,
    /// enabling membership repair when the destination answers 421.
    pub async fn send_with_retry(
        &self,
        destination: &OnionDestination,
        payload: &[u8],
        version: OnionVersion,
        swarm_pubkey: Option<&str>,
    ) -> Result<OnionResponse> {
        let mut exclude: Option<String> = None;

        for attempt in 1..=MAX_PATH_ATTEMPTS {
            let path = self.paths.get_path(exclude.as_deref()).await?;

            let decision = match self
                .transport
                .send(&path, destination, payload, version)
                .await
            {
                Ok(response) => {
                    // Every hop relayed; the route is good regardless of
                    // what the destination answered.
                    self.paths.mark_path_healthy(path.id).await;
                    match response.status {
                        None => {
                            self.handler.on_success(destination).await;
                            return Ok(response);
                        }
                        Some(status) => {
                            self.handler
                                .on_destination_status(
                                    destination,
                                    status,
                                    &response.body,
                                    swarm_pubkey,
                                )
                                .await
                        }
                    }
                }
                Err(onion_error) => {
                    warn!("onion attempt {attempt} failed: {onion_error}");
                    self.handler
                        .on_transport_failure(&onion_error, &path)
                        .await
                }
            };

            match decision {
                Decision::Retry { exclude_node } => {
                    debug!("retrying with fresh path (attempt {attempt})");
                    exclude = exclude_node;
                }
                Decision::RetryAfterClockSync => return Err(Error::ClockOutOfSync),
                Decision::Fail(error) => return Err(error),
            }
        }

        Err(Error::Unreachable {
            attempts: MAX_PATH_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::onion::{OnionError, OnionPath};
    use crate::snode::test_support::test_node;
    use crate::snode::{NetworkClock, SnodePool, StaticSeed, SwarmDirectory};

    /// Transport that replays a script and records the paths it was given.
    struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<OnionResponse, OnionError>>>,
        seen_paths: Mutex<Vec<OnionPath>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<std::result::Result<OnionResponse, OnionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen_paths: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OnionTransport for ScriptedTransport {
        async fn send(
            &self,
            path: &OnionPath,
            _destination: &OnionDestination,
            _payload: &[u8],
            _version: OnionVersion,
        ) -> std::result::Result<OnionResponse, OnionError> {
            self.seen_paths
                .lock()
                .expect("lock")
                .push(path.clone());
            self.script
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(OnionError::Unknown("script exhausted".into())))
        }
    }

    fn network_with(
        transport: Arc<ScriptedTransport>,
    ) -> (SessionNetwork, Arc<SnodePool>) {
        let pool = Arc::new(SnodePool::new(Arc::new(StaticSeed(
            (1..=10).map(test_node).collect(),
        ))));
        let swarms = Arc::new(SwarmDirectory::new());
        let paths = Arc::new(PathManager::new(Arc::clone(&pool), Arc::clone(&swarms)));
        let handler = Arc::new(FailureHandler::new(
            Arc::clone(&paths),
            swarms,
            Arc::new(NetworkClock::new()),
        ));
        (SessionNetwork::new(paths, transport, handler), pool)
    }

    fn ok_response(body: &[u8]) -> std::result::Result<OnionResponse, OnionError> {
        Ok(OnionResponse {
            status: None,
            body: body.to_vec(),
        })
    }

    fn error_response(
        status: u16,
        body: &[u8],
    ) -> std::result::Result<OnionResponse, OnionError> {
        Ok(OnionResponse {
            status: Some(status),
            body: body.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok_response(b"pong")]));
        let (network, _) = network_with(Arc::clone(&transport));

        let response = network
            .send_with_retry(
                &OnionDestination::Snode(test_node(1)),
                b"ping",
                OnionVersion::V4,
                None,
            )
            .await
            .expect("should succeed");
        assert_eq!(response.body, b"pong");
        assert_eq!(transport.seen_paths.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_intermediate_failure_retries_excluding_node() {
        let victim = test_node(5).key().to_string();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(OnionError::IntermediateNodeFailed {
                failed_key: Some(victim.clone()),
            }),
            ok_response(b"ok"),
        ]));
        let (network, pool) = network_with(Arc::clone(&transport));

        let response = network
            .send_with_retry(
                &OnionDestination::Snode(test_node(1)),
                b"ping",
                OnionVersion::V4,
                None,
            )
            .await
            .expect("should recover");
        assert_eq!(response.body, b"ok");

        let seen = transport.seen_paths.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert!(!seen[1].contains(&victim));
        assert!(!pool.contains(&victim).await);
    }

    #[tokio::test]
    async fn test_clock_skew_surfaces_without_retrying() {
        let transport = Arc::new(ScriptedTransport::new(vec![error_response(406, b"")]));
        let (network, _) = network_with(Arc::clone(&transport));

        let result = network
            .send_with_retry(
                &OnionDestination::Snode(test_node(1)),
                b"ping",
                OnionVersion::V4,
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::ClockOutOfSync)));
        assert_eq!(transport.seen_paths.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_fails_immediately() {
        let transport = Arc::new(ScriptedTransport::new(vec![error_response(
            403,
            b"forbidden",
        )]));
        let (network, _) = network_with(Arc::clone(&transport));

        let result = network
            .send_with_retry(
                &OnionDestination::Snode(test_node(1)),
                b"ping",
                OnionVersion::V4,
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Destination { status: 403, .. })
        ));
        assert_eq!(transport.seen_paths.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_unreachable() {
        let script = (0..MAX_PATH_ATTEMPTS)
            .map(|_| Err(OnionError::GuardUnreachable("refused".into())))
            .collect();
        let transport = Arc::new(ScriptedTransport::new(script));
        let (network, _) = network_with(Arc::clone(&transport));

        let result = network
            .send_with_retry(
                &OnionDestination::Snode(test_node(1)),
                b"ping",
                OnionVersion::V4,
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Unreachable {
                attempts: MAX_PATH_ATTEMPTS
            })
        ));
        assert_eq!(
            transport.seen_paths.lock().expect("lock").len(),
            MAX_PATH_ATTEMPTS as usize
        );
    }
}
