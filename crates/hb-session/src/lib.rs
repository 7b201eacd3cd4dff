//! hb-session: the update-poll state machine.
//!
//! `Session::probe` walks the fixed S0-S8 protocol described in the
//! module docs below exactly once per call and always returns a
//! [`Terminal`] status — failures are folded into the status rather than
//! propagated as `Err`, mirroring how the original embedded client never
//! lets an internal error escape a poll uncaught.
//!
//! The orchestrator is generic over its collaborators
//! ([`Bootloader`], [`DeviceIdentity`]) and the HTTP layer
//! ([`hb_transport::SessionTransport`]), the same shape
//! `rt-updater`'s workflow module uses to keep its state machine
//! testable against mock collaborators instead of live services.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hb_action_log::ActionLog;
use hb_artifact_sink::{ArtifactSink, ExpectedHashes, FlashSlot, SinkError};
use hb_protocol::{encode_close, encode_config_data, encode_feedback, Execution, Finished};
use hb_transport::{SessionTransport, TransportError};
use thiserror::Error;

/// Default polling interval used whenever the server has not (yet) sent
/// a valid `polling.sleep` directive: 300 seconds.
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    NoUpdate,
    UpdateInstalled,
    CancelUpdate,
    UnconfirmedImage,
    DownloadError,
    NetworkingError,
    MetadataError,
}

#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("bootloader error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity error: {0}")]
    Other(String),
}

/// The bootloader integration: slot confirmation and swap requests.
pub trait Bootloader: Send + Sync {
    fn is_confirmed(&self) -> Result<bool, BootloaderError>;
    fn confirm(&self) -> Result<(), BootloaderError>;
    fn erase_bank(&self) -> Result<(), BootloaderError>;
    fn request_swap(&self) -> Result<(), BootloaderError>;
}

/// Device identity and firmware-version providers.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> Result<String, IdentityError>;
    fn firmware_version(&self) -> Result<String, IdentityError>;
}

/// Per-poll configuration: server addressing and the spare slot's size.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub json_url_root: String,
    pub board: String,
    pub hw_revision: String,
    pub spare_slot_size_bytes: u64,
}

/// Creates a fresh [`FlashSlot`] for one download. Called once per poll
/// that reaches the download state, sized to the artifact's declared
/// length.
pub trait SlotFactory: Send + Sync {
    fn create(&self, declared_size: u64) -> Result<Box<dyn FlashSlot>, SinkError>;
}

impl<F> SlotFactory for F
where
    F: Fn(u64) -> Result<Box<dyn FlashSlot>, SinkError> + Send + Sync,
{
    fn create(&self, declared_size: u64) -> Result<Box<dyn FlashSlot>, SinkError> {
        self(declared_size)
    }
}

/// Runs one poll cycle against a configured server, collaborators, and
/// persistent stores.
pub struct Session {
    transport: Box<dyn SessionTransport>,
    action_log: ActionLog,
    bootloader: Box<dyn Bootloader>,
    identity: Box<dyn DeviceIdentity>,
    slot_factory: Box<dyn SlotFactory>,
    config: SessionConfig,
    poll_interval_ms: Arc<AtomicU32>,
}

impl Session {
    pub fn new(
        transport: Box<dyn SessionTransport>,
        action_log: ActionLog,
        bootloader: Box<dyn Bootloader>,
        identity: Box<dyn DeviceIdentity>,
        slot_factory: Box<dyn SlotFactory>,
        config: SessionConfig,
        poll_interval_ms: Arc<AtomicU32>,
    ) -> Self {
        Session {
            transport,
            action_log,
            bootloader,
            identity,
            slot_factory,
            config,
            poll_interval_ms,
        }
    }

    /// Current polling interval, in milliseconds, as last set by a server
    /// directive (or the process default).
    pub fn poll_interval_ms(&self) -> u32 {
        self.poll_interval_ms.load(Ordering::SeqCst)
    }

    /// Run the S0-S8 protocol once. Never returns `Err`; every failure
    /// path is folded into a [`Terminal`] variant.
    pub async fn probe(&mut self) -> Terminal {
        match self.run().await {
            Ok(terminal) | Err(terminal) => terminal,
        }
    }

    async fn run(&mut self) -> Result<Terminal, Terminal> {
        // S0 Preflight.
        let confirmed = self
            .bootloader
            .is_confirmed()
            .map_err(|_| Terminal::MetadataError)?;
        if !confirmed {
            return Ok(Terminal::UnconfirmedImage);
        }
        let firmware_version = self
            .identity
            .firmware_version()
            .map_err(|_| Terminal::MetadataError)?;
        let device_id = self
            .identity
            .device_id()
            .map_err(|_| Terminal::MetadataError)?;
        tracing::debug!(%firmware_version, %device_id, "preflight ok");

        // S2 Poll base (S1 connect is implicit in the first request's retry loop).
        let poll_url = format!("{}/{}-{}", self.config.json_url_root, self.config.board, device_id);
        let body = self
            .transport
            .get_json(&poll_url)
            .await
            .map_err(map_get_err)?;
        let control = hb_protocol::parse_control_response(&body).map_err(|_| Terminal::MetadataError)?;

        if let Some(sleep) = &control.polling_sleep {
            if let Some(ms) = hb_protocol::parse_polling_sleep_ms(sleep) {
                self.poll_interval_ms.store(ms, Ordering::SeqCst);
            }
        }

        // S3 Cancel branch (takes priority over config, per Design Notes §9).
        if let Some(cancel_href) = &control.cancel_action_href {
            let action_id =
                hb_protocol::parse_cancel_action_id(cancel_href).map_err(|_| Terminal::MetadataError)?;
            let url = format!(
                "{}/{}-{}/cancelAction/{}/feedback",
                self.config.json_url_root, self.config.board, device_id, action_id
            );
            let payload =
                encode_close(action_id, Execution::Closed, Finished::Success).map_err(|_| Terminal::MetadataError)?;
            self.transport
                .post_json(&url, payload)
                .await
                .map_err(|_| Terminal::NetworkingError)?;
            return Ok(Terminal::CancelUpdate);
        }

        // S4 Config branch.
        if control.config_data_href.is_some() {
            let url = format!(
                "{}/{}-{}/configData",
                self.config.json_url_root, self.config.board, device_id
            );
            let payload = encode_config_data(
                &device_id,
                &self.config.hw_revision,
                Execution::Closed,
                Finished::Success,
            )
            .map_err(|_| Terminal::MetadataError)?;
            match self.transport.put_json(&url, payload).await {
                Ok(status) if status != 200 => {
                    tracing::debug!(status, "configData PUT returned non-200, proceeding anyway");
                }
                Ok(_) => {}
                Err(_) => return Err(Terminal::NetworkingError),
            }
        }

        // S5 Deployment probe.
        let Some(deployment_href) = &control.deployment_base_href else {
            return Ok(Terminal::NoUpdate);
        };
        let deployment_path =
            hb_protocol::extract_deployment_path(deployment_href).map_err(|_| Terminal::MetadataError)?;
        let url = format!(
            "{}/{}-{}/{}",
            self.config.json_url_root, self.config.board, device_id, deployment_path
        );
        let body = self.transport.get_json(&url).await.map_err(map_get_err)?;
        let deployment = hb_protocol::parse_deployment_response(&body).map_err(|_| Terminal::MetadataError)?;

        if deployment.chunk.artifact.size < 0
            || deployment.chunk.artifact.size as u64 > self.config.spare_slot_size_bytes
        {
            return Ok(Terminal::MetadataError);
        }

        // S6 Dedup check.
        let last_installed = self.action_log.get().map_err(|_| Terminal::MetadataError)?;
        if last_installed == deployment.action_id {
            let url = format!(
                "{}/{}-{}/deploymentBase/{}/feedback",
                self.config.json_url_root, self.config.board, device_id, deployment.action_id
            );
            let payload = encode_feedback(deployment.action_id, Execution::Closed, Finished::Success)
                .map_err(|_| Terminal::MetadataError)?;
            self.transport
                .post_json(&url, payload)
                .await
                .map_err(|_| Terminal::NetworkingError)?;
            return Ok(Terminal::Ok);
        }

        // S7 Download.
        let declared_size = deployment.chunk.artifact.size as u64;
        let slot = self
            .slot_factory
            .create(declared_size)
            .map_err(|_| Terminal::DownloadError)?;
        let mut sink =
            ArtifactSink::new(slot, self.config.spare_slot_size_bytes, declared_size)
                .map_err(|_| Terminal::MetadataError)?;

        let write_result = self
            .transport
            .download(
                &deployment.chunk.artifact.download_http_href,
                Box::new(|chunk: &[u8]| sink.write(chunk).map_err(|e| e.to_string())),
            )
            .await;
        write_result.map_err(map_download_err)?;

        let expected = ExpectedHashes {
            sha256: deployment.chunk.artifact.hashes.sha256.clone(),
            sha1: deployment.chunk.artifact.hashes.sha1.clone(),
            md5: deployment.chunk.artifact.hashes.md5.clone(),
        };
        sink.finish(&expected).map_err(|_| Terminal::DownloadError)?;

        // S8 Request swap.
        self.bootloader
            .request_swap()
            .map_err(|_| Terminal::DownloadError)?;
        self.action_log
            .put(deployment.action_id)
            .map_err(|_| Terminal::MetadataError)?;
        Ok(Terminal::UpdateInstalled)
    }
}

fn map_get_err(e: TransportError) -> Terminal {
    match e {
        TransportError::Request(_) => Terminal::NetworkingError,
        TransportError::HttpStatus(_)
        | TransportError::ResponseTooLarge { .. }
        | TransportError::ContentLengthMismatch { .. }
        | TransportError::Sink(_) => Terminal::MetadataError,
    }
}

fn map_download_err(e: TransportError) -> Terminal {
    match e {
        TransportError::Sink(_) => Terminal::DownloadError,
        _ => Terminal::NetworkingError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_artifact_sink::FileFlashSlot;
    use hb_transport::DownloadOutcome;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct MockBootloader {
        confirmed: bool,
        swap_called: Mutex<bool>,
    }

    impl Bootloader for MockBootloader {
        fn is_confirmed(&self) -> Result<bool, BootloaderError> {
            Ok(self.confirmed)
        }
        fn confirm(&self) -> Result<(), BootloaderError> {
            Ok(())
        }
        fn erase_bank(&self) -> Result<(), BootloaderError> {
            Ok(())
        }
        fn request_swap(&self) -> Result<(), BootloaderError> {
            *self.swap_called.lock().unwrap() = true;
            Ok(())
        }
    }

    struct MockIdentity;

    impl DeviceIdentity for MockIdentity {
        fn device_id(&self) -> Result<String, IdentityError> {
            Ok("DID".to_owned())
        }
        fn firmware_version(&self) -> Result<String, IdentityError> {
            Ok("1.0.0".to_owned())
        }
    }

    type ResponseMap = std::collections::HashMap<String, Vec<u8>>;

    struct MockTransport {
        get_responses: ResponseMap,
        download_body: Vec<u8>,
    }

    impl SessionTransport for MockTransport {
        fn get_json<'a>(
            &'a self,
            url: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>> {
            let resp = self.get_responses.get(url).cloned();
            Box::pin(async move {
                resp.ok_or(TransportError::HttpStatus(404))
            })
        }

        fn put_json<'a>(
            &'a self,
            _url: &'a str,
            _body: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
            Box::pin(async { Ok(200) })
        }

        fn post_json<'a>(
            &'a self,
            _url: &'a str,
            _body: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
            Box::pin(async { Ok(200) })
        }

        fn download<'a>(
            &'a self,
            _url: &'a str,
            mut on_chunk: Box<dyn FnMut(&[u8]) -> Result<(), String> + Send + 'a>,
        ) -> Pin<Box<dyn Future<Output = Result<DownloadOutcome, TransportError>> + Send + 'a>> {
            let data = self.download_body.clone();
            Box::pin(async move {
                on_chunk(&data).map_err(TransportError::Sink)?;
                Ok(DownloadOutcome { total_bytes: data.len() as u64 })
            })
        }
    }

    fn make_session(transport: MockTransport, bootloader: MockBootloader) -> Session {
        let dir = tempfile::tempdir().unwrap();
        let slot_dir = dir.into_path();
        Session::new(
            Box::new(transport),
            ActionLog::open_in_memory().unwrap(),
            Box::new(bootloader),
            Box::new(MockIdentity),
            Box::new(move |_size: u64| {
                let path = slot_dir.join("slot.bin");
                Ok(Box::new(FileFlashSlot::create(&path)?) as Box<dyn FlashSlot>)
            }),
            SessionConfig {
                json_url_root: "http://srv/default/controller/v1".to_owned(),
                board: "bd".to_owned(),
                hw_revision: "3".to_owned(),
                spare_slot_size_bytes: 1 << 20,
            },
            Arc::new(AtomicU32::new(DEFAULT_POLL_INTERVAL_MS)),
        )
    }

    #[tokio::test]
    async fn unconfirmed_image_short_circuits() {
        let mut session = make_session(
            MockTransport { get_responses: ResponseMap::new(), download_body: vec![] },
            MockBootloader { confirmed: false, swap_called: Mutex::new(false) },
        );
        assert_eq!(session.probe().await, Terminal::UnconfirmedImage);
    }

    #[tokio::test]
    async fn idle_poll_updates_interval_and_returns_no_update() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID".to_owned(),
            br#"{"config":{"polling":{"sleep":"00:05:00"}},"_links":{}}"#.to_vec(),
        );
        let mut session = make_session(
            MockTransport { get_responses: responses, download_body: vec![] },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        assert_eq!(session.probe().await, Terminal::NoUpdate);
        assert_eq!(session.poll_interval_ms(), 300_000);
    }

    #[tokio::test]
    async fn cancellation_returns_cancel_update() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID".to_owned(),
            br#"{"config":{"polling":{"sleep":"00:05:00"}},"_links":{"cancelAction":{"href":"http://srv/default/controller/v1/bd-DID/cancelAction/42"}}}"#.to_vec(),
        );
        let mut session = make_session(
            MockTransport { get_responses: responses, download_body: vec![] },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        assert_eq!(session.probe().await, Terminal::CancelUpdate);
    }

    fn deployment_json(id: &str, size: usize) -> Vec<u8> {
        format!(
            r#"{{"id":"{id}","deployment":{{"download":"forced","update":"forced","chunks":[
                {{"part":"bApp","name":"app","version":"1.0","artifacts":[{{
                    "filename":"app.bin","size":{size},
                    "hashes":{{"sha1":null,"md5":null,"sha256":"{hash}"}},
                    "_links":{{"download-http":{{"href":"http://srv/DEFAULT/controller/v1/bd-DID/deploymentBase/{id}/artifacts/app.bin"}}}}
                }}]}}
            ]}}}}"#,
            id = id,
            size = size,
            hash = hex::encode(sha2_of(&vec![0xABu8; size])),
        )
        .into_bytes()
    }

    fn sha2_of(data: &[u8]) -> Vec<u8> {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    #[tokio::test]
    async fn first_time_install_downloads_and_requests_swap() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID".to_owned(),
            br#"{"config":{"polling":{"sleep":"00:05:00"}},"_links":{"deploymentBase":{"href":"http://srv/default/controller/v1/bd-DID/deploymentBase/17"}}}"#.to_vec(),
        );
        responses.insert(
            "http://srv/default/controller/v1/bd-DID/deploymentBase/17".to_owned(),
            deployment_json("17", 4096),
        );
        let download_body = vec![0xABu8; 4096];
        let mut session = make_session(
            MockTransport { get_responses: responses, download_body },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        assert_eq!(session.probe().await, Terminal::UpdateInstalled);
    }

    #[tokio::test]
    async fn dedup_hit_skips_download() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID".to_owned(),
            br#"{"config":{"polling":{"sleep":"00:05:00"}},"_links":{"deploymentBase":{"href":"http://srv/default/controller/v1/bd-DID/deploymentBase/17"}}}"#.to_vec(),
        );
        responses.insert(
            "http://srv/default/controller/v1/bd-DID/deploymentBase/17".to_owned(),
            deployment_json("17", 4096),
        );
        let mut session = make_session(
            MockTransport { get_responses: responses, download_body: vec![] },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        session.action_log.put(17).unwrap();
        assert_eq!(session.probe().await, Terminal::Ok);
    }

    #[tokio::test]
    async fn schema_violation_yields_metadata_error() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID".to_owned(),
            br#"{"config":{"polling":{"sleep":"00:05:00"}},"_links":{"deploymentBase":{"href":"http://srv/default/controller/v1/bd-DID/deploymentBase/17"}}}"#.to_vec(),
        );
        let bad_body = br#"{"id":"17","deployment":{"download":"forced","update":"forced","chunks":[
            {"part":"bApp","name":"a","version":"1","artifacts":[{"filename":"a","size":1,"hashes":{"sha1":null,"md5":null,"sha256":null},"_links":{"download-http":{"href":"http://srv/DEFAULT/controller/v1/x"}}}]},
            {"part":"bApp","name":"b","version":"1","artifacts":[{"filename":"b","size":1,"hashes":{"sha1":null,"md5":null,"sha256":null},"_links":{"download-http":{"href":"http://srv/DEFAULT/controller/v1/y"}}}]}
        ]}}"#.to_vec();
        responses.insert(
            "http://srv/default/controller/v1/bd-DID/deploymentBase/17".to_owned(),
            bad_body,
        );
        let mut session = make_session(
            MockTransport { get_responses: responses, download_body: vec![] },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        assert_eq!(session.probe().await, Terminal::MetadataError);
    }

    #[tokio::test]
    async fn unregistered_poll_url_yields_metadata_error() {
        let mut session = make_session(
            MockTransport { get_responses: ResponseMap::new(), download_body: vec![] },
            MockBootloader { confirmed: true, swap_called: Mutex::new(false) },
        );
        // No matching URL registered -> MockTransport returns HttpStatus(404).
        // A connect-level failure mapping to NetworkingError is exercised in
        // hb-transport's own retry unit test.
        assert_eq!(session.probe().await, Terminal::MetadataError);
    }
}
