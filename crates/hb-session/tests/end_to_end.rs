//! End-to-end coverage of the Session Orchestrator against a mock HTTP
//! layer and mock collaborators, driving the public API the way a real
//! binary crate would assemble it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hb_action_log::ActionLog;
use hb_artifact_sink::{read_file_slot, FileFlashSlot, FlashSlot};
use hb_session::{
    Bootloader, BootloaderError, DeviceIdentity, IdentityError, Session, SessionConfig, Terminal,
};
use hb_transport::{DownloadOutcome, SessionTransport, TransportError};

struct StubBootloader {
    confirmed: bool,
    swap_requested: Arc<Mutex<bool>>,
}

impl Bootloader for StubBootloader {
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
        *self.swap_requested.lock().unwrap() = true;
        Ok(())
    }
}

struct StubIdentity;

impl DeviceIdentity for StubIdentity {
    fn device_id(&self) -> Result<String, IdentityError> {
        Ok("DID".to_owned())
    }
    fn firmware_version(&self) -> Result<String, IdentityError> {
        Ok("2.3.1".to_owned())
    }
}

struct StubTransport {
    gets: HashMap<String, Vec<u8>>,
    posts: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    download_body: Vec<u8>,
}

impl SessionTransport for StubTransport {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>> {
        let resp = self.gets.get(url).cloned();
        Box::pin(async move { resp.ok_or(TransportError::HttpStatus(404)) })
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
        url: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
        self.posts.lock().unwrap().push((url.to_owned(), body));
        Box::pin(async { Ok(200) })
    }

    fn download<'a>(
        &'a self,
        _url: &'a str,
        mut on_chunk: Box<dyn FnMut(&[u8]) -> Result<(), String> + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<DownloadOutcome, TransportError>> + Send + 'a>> {
        let body = self.download_body.clone();
        Box::pin(async move {
            on_chunk(&body).map_err(TransportError::Sink)?;
            Ok(DownloadOutcome { total_bytes: body.len() as u64 })
        })
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn deployment_response(id: &str, artifact: &[u8]) -> Vec<u8> {
    format!(
        r#"{{"id":"{id}","deployment":{{"download":"forced","update":"forced","chunks":[
            {{"part":"bApp","name":"app","version":"1.0","artifacts":[{{
                "filename":"app.bin","size":{size},
                "hashes":{{"sha1":null,"md5":null,"sha256":"{hash}"}},
                "_links":{{"download-http":{{"href":"http://srv/DEFAULT/controller/v1/bd-DID/deploymentBase/{id}/artifacts/app.bin"}}}}
            }}]}}
        ]}}}}"#,
        id = id,
        size = artifact.len(),
        hash = sha256_hex(artifact),
    )
    .into_bytes()
}

#[tokio::test]
async fn full_install_then_repeat_poll_is_a_dedup_hit() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = vec![0x42u8; 8192];

    let mut gets = HashMap::new();
    gets.insert(
        "http://srv/default/controller/v1/bd-DID".to_owned(),
        br#"{"config":{"polling":{"sleep":"00:10:00"}},"_links":{"deploymentBase":{"href":"http://srv/default/controller/v1/bd-DID/deploymentBase/99"}}}"#.to_vec(),
    );
    gets.insert(
        "http://srv/default/controller/v1/bd-DID/deploymentBase/99".to_owned(),
        deployment_response("99", &artifact),
    );

    let posts = Arc::new(Mutex::new(Vec::new()));
    let swap_requested = Arc::new(Mutex::new(false));
    let slot_path = dir.path().join("spare.bin");

    let make_session = |action_log: ActionLog, gets: HashMap<String, Vec<u8>>, download_body: Vec<u8>| {
        let slot_path = slot_path.clone();
        Session::new(
            Box::new(StubTransport { gets, posts: posts.clone(), download_body }),
            action_log,
            Box::new(StubBootloader { confirmed: true, swap_requested: swap_requested.clone() }),
            Box::new(StubIdentity),
            Box::new(move |_size: u64| {
                FileFlashSlot::create(&slot_path).map(|s| Box::new(s) as Box<dyn FlashSlot>)
            }),
            SessionConfig {
                json_url_root: "http://srv/default/controller/v1".to_owned(),
                board: "bd".to_owned(),
                hw_revision: "3".to_owned(),
                spare_slot_size_bytes: 1 << 20,
            },
            Arc::new(AtomicU32::new(300_000)),
        )
    };

    let action_log_path = dir.path().join("action_log.sqlite");
    let first_log = ActionLog::open(&action_log_path).unwrap();
    let mut session = make_session(first_log, gets.clone(), artifact.clone());
    let terminal = session.probe().await;
    assert_eq!(terminal, Terminal::UpdateInstalled);
    assert!(*swap_requested.lock().unwrap());
    assert_eq!(session.poll_interval_ms(), 600_000);

    let on_disk = read_file_slot(&slot_path).unwrap();
    assert_eq!(on_disk, artifact);

    // Second poll: same deployment id is already installed -> dedup hit, no new download.
    let second_log = ActionLog::open(&action_log_path).unwrap();
    assert_eq!(second_log.get().unwrap(), 99);
    let mut second = make_session(second_log, gets, vec![]);
    let terminal2 = second.probe().await;
    assert_eq!(terminal2, Terminal::Ok);

    let posted = posts.lock().unwrap();
    assert!(posted.iter().any(|(url, _)| url.contains("deploymentBase/99/feedback")));
}
