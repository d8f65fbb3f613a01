use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_core::keys::PublishRequest;
use tessera_core::rate_limit::RateLimitedAction;
use tessera_core::store::PreKeyStats;
use tessera_core::{
    AuthProof, ErrorKind, LinkChallenge, LinkSubmission, LinkedDevice, TrustError, WipeReport,
};
use tessera_crypto::signal::{
    PreKeyBundle, PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::server_state::ServerState;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;

/// Request from a client to the trust daemon, one JSON object per line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum IpcRequest {
    /// Prekey bundle for starting a session with `target_user_id`.
    FetchPreKeyBundle { target_user_id: String },
    /// Upload the caller's public key material.
    PublishKeys {
        auth: AuthProof,
        identity: PublishedIdentity,
        signed_prekey: PublishedSignedPreKey,
        #[serde(default)]
        one_time_prekeys: Vec<PublishedOneTimePreKey>,
    },
    /// Unused one-time prekeys left for the caller.
    PreKeyStatus { auth: AuthProof },
    /// Start linking a new device.
    IssueDeviceLink,
    /// Complete a link with the trusted device's signature.
    SubmitDeviceLink(LinkSubmission),
    /// Purge one of the caller's devices.
    WipeDevice { auth: AuthProof, device_id: String },
    SearchUsers {
        auth: AuthProof,
        prefix: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetStatus,
    Shutdown,
}

impl IpcRequest {
    /// Method name signed into auth proofs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::FetchPreKeyBundle { .. } => "fetchPreKeyBundle",
            Self::PublishKeys { .. } => "publishKeys",
            Self::PreKeyStatus { .. } => "preKeyStatus",
            Self::IssueDeviceLink => "issueDeviceLink",
            Self::SubmitDeviceLink(_) => "submitDeviceLink",
            Self::WipeDevice { .. } => "wipeDevice",
            Self::SearchUsers { .. } => "searchUsers",
            Self::GetStatus => "getStatus",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response from the daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum IpcResponse {
    Ok,
    Bundle { bundle: Option<PreKeyBundle> },
    PreKeyStatus(PreKeyStats),
    LinkIssued(LinkChallenge),
    DeviceLinked(LinkedDevice),
    Wiped(WipeReport),
    Users { user_ids: Vec<String> },
    Status {
        uptime_secs: u64,
        audit_entries: usize,
    },
    Error(WireError),
}

/// Error shape on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&TrustError> for WireError {
    fn from(e: &TrustError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retry_after_secs: e.retry_after_secs(),
        }
    }
}

/// Start the IPC listener on a Unix socket.
///
/// Reads newline-delimited JSON requests and writes JSON responses.
pub async fn start_ipc_listener(
    socket_path: &str,
    state: Arc<ServerState>,
    shutdown_tx: mpsc::Sender<()>,
) {
    // Remove stale socket file if it exists
    let _ = std::fs::remove_file(socket_path);

    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, path = %socket_path, "failed to bind IPC socket");
            return;
        }
    };

    tracing::info!(path = %socket_path, "IPC listener started");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();

                    while let Ok(Some(line)) = lines.next_line().await {
                        let response = match serde_json::from_str::<IpcRequest>(&line) {
                            Ok(request) => handle_ipc_request(&state, request, &shutdown_tx).await,
                            Err(e) => IpcResponse::Error(WireError {
                                kind: ErrorKind::Validation,
                                message: format!("invalid request: {e}"),
                                retry_after_secs: None,
                            }),
                        };

                        let mut buf = serde_json::to_vec(&response).unwrap_or_default();
                        buf.push(b'\n');
                        if let Err(e) = writer.write_all(&buf).await {
                            tracing::warn!(error = %e, "failed to write IPC response");
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "IPC accept error");
            }
        }
    }
}

pub async fn handle_ipc_request(
    state: &ServerState,
    request: IpcRequest,
    shutdown_tx: &mpsc::Sender<()>,
) -> IpcResponse {
    if matches!(request, IpcRequest::Shutdown) {
        tracing::info!("shutdown requested via IPC");
        let _ = shutdown_tx.send(()).await;
        return IpcResponse::Ok;
    }

    let method = request.method();
    match dispatch(state, request) {
        Ok(response) => response,
        Err(e) => {
            if e.kind() == ErrorKind::Authorization {
                tracing::warn!(method, error = %e, "request rejected");
            } else {
                tracing::debug!(method, error = %e, "request failed");
            }
            IpcResponse::Error(WireError::from(&e))
        }
    }
}

fn dispatch(state: &ServerState, request: IpcRequest) -> Result<IpcResponse, TrustError> {
    let services = &state.services;
    let method = request.method();
    match request {
        IpcRequest::FetchPreKeyBundle { target_user_id } => {
            services
                .limiters
                .check(RateLimitedAction::BundleFetch, &target_user_id)?;
            let bundle = services.directory.fetch_bundle(&target_user_id)?;
            Ok(IpcResponse::Bundle { bundle })
        }
        IpcRequest::PublishKeys {
            auth,
            identity,
            signed_prekey,
            one_time_prekeys,
        } => {
            let caller = services.auth.authenticate_publish(method, &auth, &identity)?;
            services.directory.publish_keys(
                &caller,
                &PublishRequest {
                    identity,
                    signed_prekey,
                    one_time_prekeys,
                },
            )?;
            Ok(IpcResponse::Ok)
        }
        IpcRequest::PreKeyStatus { auth } => {
            let caller = services.auth.authenticate(method, &auth)?;
            Ok(IpcResponse::PreKeyStatus(
                services.directory.prekey_status(&caller)?,
            ))
        }
        IpcRequest::IssueDeviceLink => Ok(IpcResponse::LinkIssued(
            services.device_links.issue_request()?,
        )),
        IpcRequest::SubmitDeviceLink(submission) => Ok(IpcResponse::DeviceLinked(
            services.device_links.submit(&submission)?,
        )),
        IpcRequest::WipeDevice { auth, device_id } => {
            let caller = services.auth.authenticate(method, &auth)?;
            Ok(IpcResponse::Wiped(
                services.wipe.wipe_device(&caller, &device_id)?,
            ))
        }
        IpcRequest::SearchUsers {
            auth,
            prefix,
            limit,
        } => {
            let caller = services.auth.authenticate(method, &auth)?;
            services
                .limiters
                .check(RateLimitedAction::Search, caller.user_id())?;
            let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT);
            Ok(IpcResponse::Users {
                user_ids: services.directory.search_users(&prefix, limit)?,
            })
        }
        IpcRequest::GetStatus => Ok(IpcResponse::Status {
            uptime_secs: state.uptime_secs(),
            audit_entries: services.audit.len(),
        }),
        IpcRequest::Shutdown => Ok(IpcResponse::Ok),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tessera_core::config::KeyConfig;
    use tessera_core::device_link::sign_challenge;
    use tessera_core::{KeyManager, ManualClock, SqliteStore, TrustConfig, TrustServices};
    use tessera_crypto::{Identity, MemoryKeychain};
    use tokio::net::UnixStream;

    fn state() -> (Arc<ManualClock>, ServerState) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let services = TrustServices::new(store, TrustConfig::default(), clock.clone());
        (clock.clone(), ServerState::new(services, clock))
    }

    fn register(clock: &Arc<ManualClock>, user: &str) -> (KeyManager, PublishRequest) {
        KeyManager::register(
            user,
            Arc::new(MemoryKeychain::new()),
            clock.clone(),
            KeyConfig {
                one_time_prekey_pool_size: 2,
                replenish_below: 1,
                ..KeyConfig::default()
            },
        )
        .unwrap()
    }

    async fn call(state: &ServerState, request: IpcRequest) -> IpcResponse {
        let (tx, _rx) = mpsc::channel(1);
        handle_ipc_request(state, request, &tx).await
    }

    async fn publish(state: &ServerState, manager: &KeyManager, keys: PublishRequest) -> IpcResponse {
        call(
            state,
            IpcRequest::PublishKeys {
                auth: manager.auth_proof("publishKeys"),
                identity: keys.identity,
                signed_prekey: keys.signed_prekey,
                one_time_prekeys: keys.one_time_prekeys,
            },
        )
        .await
    }

    #[tokio::test]
    async fn publish_then_fetch_bundle() {
        let (clock, state) = state();
        let (bob, keys) = register(&clock, "bob");
        assert!(matches!(publish(&state, &bob, keys).await, IpcResponse::Ok));

        let response = call(
            &state,
            IpcRequest::FetchPreKeyBundle {
                target_user_id: "bob".into(),
            },
        )
        .await;
        let IpcResponse::Bundle { bundle: Some(bundle) } = response else {
            panic!("expected bundle");
        };
        assert_eq!(bundle.one_time_prekey_id, Some(1));

        let status = call(
            &state,
            IpcRequest::PreKeyStatus {
                auth: bob.auth_proof("preKeyStatus"),
            },
        )
        .await;
        assert!(matches!(status, IpcResponse::PreKeyStatus(PreKeyStats { unused: 1, .. })));
    }

    #[tokio::test]
    async fn unknown_target_yields_null_bundle() {
        let (_clock, state) = state();
        let response = call(
            &state,
            IpcRequest::FetchPreKeyBundle {
                target_user_id: "nobody".into(),
            },
        )
        .await;
        assert!(matches!(response, IpcResponse::Bundle { bundle: None }));
    }

    #[tokio::test]
    async fn proof_for_other_method_is_rejected() {
        let (clock, state) = state();
        let (bob, keys) = register(&clock, "bob");
        publish(&state, &bob, keys).await;

        let response = call(
            &state,
            IpcRequest::PreKeyStatus {
                auth: bob.auth_proof("wipeDevice"),
            },
        )
        .await;
        let IpcResponse::Error(error) = response else {
            panic!("expected error");
        };
        assert_eq!(error.kind, ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn link_and_wipe_over_dispatch() {
        let (clock, state) = state();
        let (alice, keys) = register(&clock, "alice");
        publish(&state, &alice, keys).await;

        let IpcResponse::LinkIssued(issued) = call(&state, IpcRequest::IssueDeviceLink).await else {
            panic!("expected link challenge");
        };
        let submission = LinkSubmission {
            request_id: issued.request_id.clone(),
            device_code: Some(issued.device_code.clone()),
            signature: sign_challenge(alice.identity().identity(), &issued.challenge),
            authorizing_user_id: "alice".into(),
            new_device_public_key: Identity::generate().public_key_hex(),
            device_name: None,
        };
        let IpcResponse::DeviceLinked(linked) =
            call(&state, IpcRequest::SubmitDeviceLink(submission.clone())).await
        else {
            panic!("expected linked device");
        };

        let IpcResponse::Error(again) = call(&state, IpcRequest::SubmitDeviceLink(submission)).await
        else {
            panic!("resubmission must fail");
        };
        assert_eq!(again.kind, ErrorKind::NotFound);

        let IpcResponse::Wiped(report) = call(
            &state,
            IpcRequest::WipeDevice {
                auth: alice.auth_proof("wipeDevice"),
                device_id: linked.device_id.clone(),
            },
        )
        .await
        else {
            panic!("expected wipe report");
        };
        assert!(report.success);
        assert_eq!(report.device_id, linked.device_id);
    }

    #[tokio::test]
    async fn search_is_rate_limited_with_retry_after() {
        let (clock, state) = state();
        let (alice, keys) = register(&clock, "alice");
        publish(&state, &alice, keys).await;

        let max = TrustConfig::default().rate_limits.search.max_attempts;
        for _ in 0..max {
            let response = call(
                &state,
                IpcRequest::SearchUsers {
                    auth: alice.auth_proof("searchUsers"),
                    prefix: "al".into(),
                    limit: None,
                },
            )
            .await;
            assert!(matches!(response, IpcResponse::Users { ref user_ids } if user_ids == &["alice"]));
        }

        let IpcResponse::Error(error) = call(
            &state,
            IpcRequest::SearchUsers {
                auth: alice.auth_proof("searchUsers"),
                prefix: "al".into(),
                limit: None,
            },
        )
        .await
        else {
            panic!("expected rate limit");
        };
        assert_eq!(error.kind, ErrorKind::RateLimited);
        assert!(error.retry_after_secs.unwrap_or(0) > 0);

        clock.advance(Duration::from_secs(3600));
        let response = call(
            &state,
            IpcRequest::SearchUsers {
                auth: alice.auth_proof("searchUsers"),
                prefix: "al".into(),
                limit: Some(5),
            },
        )
        .await;
        assert!(matches!(response, IpcResponse::Users { .. }));
    }

    #[test]
    fn wire_format() {
        let request: IpcRequest = serde_json::from_str(
            r#"{"method":"fetchPreKeyBundle","params":{"targetUserId":"bob"}}"#,
        )
        .unwrap();
        assert!(matches!(request, IpcRequest::FetchPreKeyBundle { ref target_user_id } if target_user_id == "bob"));

        let error = IpcResponse::Error(WireError::from(&TrustError::RateLimited {
            retry_after_secs: 9,
        }));
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["kind"], "rateLimited");
        assert_eq!(json["data"]["retryAfterSecs"], 9);

        let plain = serde_json::to_value(IpcResponse::Error(WireError::from(
            &TrustError::InvalidSignature,
        )))
        .unwrap();
        assert!(plain["data"].get("retryAfterSecs").is_none());
    }

    #[tokio::test]
    async fn socket_roundtrip_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("tessera.sock");
        let socket_str = socket.to_string_lossy().to_string();
        let (_clock, state) = state();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let listener_path = socket_str.clone();
        tokio::spawn(async move {
            start_ipc_listener(&listener_path, Arc::new(state), shutdown_tx).await;
        });

        let stream = loop {
            if let Ok(stream) = UnixStream::connect(&socket).await {
                break stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"not json\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"validation\""));

        writer.write_all(b"{\"method\":\"getStatus\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let status: IpcResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(status, IpcResponse::Status { .. }));

        writer.write_all(b"{\"method\":\"shutdown\"}\n").await.unwrap();
        lines.next_line().await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(2), shutdown_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
