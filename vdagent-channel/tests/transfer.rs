mod common;

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use common::*;

use vdagent_channel::config::SessionConfig;
use vdagent_channel::protocol::agent::*;
use vdagent_channel::protocol::channel::SPICE_MSG_MAIN_AGENT_DISCONNECTED;
use vdagent_channel::protocol::*;
use vdagent_channel::session::{RunningSession, SessionEvent};
use vdagent_channel::transfer::{CopyError, ProgressFn, FILE_XFER_CHUNK_SIZE};
use vdagent_codec::from_slice;

fn temp_file(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

fn spawn_copy(
    running: &RunningSession,
    file: &NamedTempFile,
    cancel: Option<CancellationToken>,
    progress: Option<ProgressFn>,
) -> tokio::task::JoinHandle<Result<(), CopyError>> {
    let handle = running.handle.clone();
    let path = file.path().to_path_buf();
    tokio::spawn(async move { handle.copy_files(vec![path], cancel, progress).await })
}

#[tokio::test]
async fn single_small_file_transfers() {
    let file = temp_file(b"abc");
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 1000, &caps_words(&[])).await;

    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let copy = spawn_copy(
        &running,
        &file,
        None,
        Some(Box::new(move |sent, total| {
            sink.lock().unwrap().push((sent, total));
        })),
    );

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let start: FileXferStart = from_slice(&envelope.body).unwrap();
    let manifest = std::str::from_utf8(&start.manifest[..start.manifest.len() - 1]).unwrap();
    assert!(manifest.starts_with("[vdagent-file-xfer]\n"));
    assert!(manifest.contains("size=3\n"));

    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_DATA).await;
    let data: FileXferData = from_slice(&envelope.body).unwrap();
    assert_eq!(data.id, start.id);
    assert_eq!(data.data, b"abc");

    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_SUCCESS)
        .await;

    copy.await.unwrap().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.last(), Some(&(3, 3)));
}

#[tokio::test]
async fn zero_byte_file_sends_one_empty_data_message() {
    let file = temp_file(b"");
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 1000, &caps_words(&[])).await;

    let copy = spawn_copy(&running, &file, None, None);

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let start: FileXferStart = from_slice(&envelope.body).unwrap();
    let manifest = std::str::from_utf8(&start.manifest[..start.manifest.len() - 1]).unwrap();
    assert!(manifest.contains("size=0\n"));

    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_DATA).await;
    let data: FileXferData = from_slice(&envelope.body).unwrap();
    assert_eq!(data.id, start.id);
    assert!(data.data.is_empty());

    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_SUCCESS)
        .await;

    copy.await.unwrap().unwrap();
}

#[tokio::test]
async fn non_empty_file_never_sends_an_empty_data_message() {
    // exactly one read buffer's worth, the nastiest EOF boundary
    let file = temp_file(&vec![7u8; FILE_XFER_CHUNK_SIZE]);
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 100_000, &caps_words(&[])).await;

    let copy = spawn_copy(&running, &file, None, None);

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let start: FileXferStart = from_slice(&envelope.body).unwrap();
    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;

    let mut total = 0usize;
    while total < FILE_XFER_CHUNK_SIZE {
        let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_DATA).await;
        let data: FileXferData = from_slice(&envelope.body).unwrap();
        assert!(!data.data.is_empty(), "empty data message for a non-empty file");
        total += data.data.len();
    }
    assert_eq!(total, FILE_XFER_CHUNK_SIZE);

    // the task drains now; no further data may show up
    assert!(guest
        .try_recv_agent_msg(Duration::from_millis(300))
        .await
        .is_none());

    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_SUCCESS)
        .await;
    copy.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_mid_transfer_notifies_the_agent() {
    let file = temp_file(&vec![1u8; 1024 * 1024]);
    // just enough credit for the announcement and the start message, so
    // the first data message blocks on its flush
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 2, &caps_words(&[])).await;

    let cancel = CancellationToken::new();
    let copy = spawn_copy(&running, &file, Some(cancel.clone()), None);

    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let start: FileXferStart = from_slice(&envelope.body).unwrap();
    guest
        .send_xfer_status(start.id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = copy.await.unwrap();
    assert_eq!(
        result,
        Err(CopyError::Cancelled {
            num_files: 1,
            succeed: 0,
            cancelled: 1,
            failed: 0,
        })
    );

    // release the queue; everything enqueued before the cancel drains,
    // then the cancellation status and nothing else
    guest.send_tokens(100_000).await;
    loop {
        let envelope = guest.recv_agent_msg().await;
        match envelope.kind {
            VD_AGENT_FILE_XFER_DATA => continue,
            VD_AGENT_FILE_XFER_STATUS => {
                let status: FileXferStatus = from_slice(&envelope.body).unwrap();
                assert_eq!(status.id, start.id);
                assert_eq!(status.result, VD_AGENT_FILE_XFER_STATUS_CANCELLED);
                break;
            }
            other => panic!("unexpected agent message {other}"),
        }
    }
    assert!(guest
        .try_recv_agent_msg(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn mixed_results_aggregate_as_failure() {
    let good = temp_file(b"fine");
    let bad = temp_file(b"doomed");
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 1000, &caps_words(&[])).await;

    let handle = running.handle.clone();
    let paths = vec![good.path().to_path_buf(), bad.path().to_path_buf()];
    let copy = tokio::spawn(async move { handle.copy_files(paths, None, None).await });

    let first = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let first: FileXferStart = from_slice(&first.body).unwrap();
    let second = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let second: FileXferStart = from_slice(&second.body).unwrap();

    // fail one before it sends anything, let the other run to completion
    guest
        .send_xfer_status(second.id, VD_AGENT_FILE_XFER_STATUS_ERROR)
        .await;
    guest
        .send_xfer_status(first.id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;
    let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_DATA).await;
    let data: FileXferData = from_slice(&envelope.body).unwrap();
    assert_eq!(data.id, first.id);
    guest
        .send_xfer_status(first.id, VD_AGENT_FILE_XFER_STATUS_SUCCESS)
        .await;

    let result = copy.await.unwrap();
    assert_eq!(
        result,
        Err(CopyError::Failed {
            num_files: 2,
            succeed: 1,
            cancelled: 0,
            failed: 1,
        })
    );
}

#[tokio::test]
async fn per_task_tokens_cancel_single_files() {
    let keep = temp_file(b"keep");
    let drop_me = temp_file(&vec![2u8; 1024 * 1024]);
    let (mut guest, mut running) =
        connect_with_caps(SessionConfig::default(), 1000, &caps_words(&[])).await;

    let handle = running.handle.clone();
    let paths = vec![keep.path().to_path_buf(), drop_me.path().to_path_buf()];
    let copy = tokio::spawn(async move { handle.copy_files(paths, None, None).await });

    // grab the per-file cancellation token for the big file
    let drop_path = drop_me.path().to_path_buf();
    let mut victim = None;
    for _ in 0..2 {
        let event = expect_event(&mut running, |e| {
            matches!(e, SessionEvent::NewFileTransfer { .. })
        })
        .await;
        if let SessionEvent::NewFileTransfer { path, cancel, .. } = event {
            if path == drop_path {
                victim = Some(cancel);
            }
        }
    }
    victim.expect("missing transfer event").cancel();

    let first = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
    let first: FileXferStart = from_slice(&first.body).unwrap();
    let keep_manifest = std::str::from_utf8(&first.manifest[..first.manifest.len() - 1]).unwrap();
    // the cancelled sibling may or may not have announced itself; the
    // surviving file always does
    let keep_id = if keep_manifest.contains("size=4\n") {
        first.id
    } else {
        let other = guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;
        let other: FileXferStart = from_slice(&other.body).unwrap();
        other.id
    };

    guest
        .send_xfer_status(keep_id, VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA)
        .await;
    loop {
        let envelope = guest.expect_agent_msg(VD_AGENT_FILE_XFER_DATA).await;
        let data: FileXferData = from_slice(&envelope.body).unwrap();
        if data.id == keep_id {
            assert_eq!(data.data, b"keep");
            break;
        }
    }
    guest
        .send_xfer_status(keep_id, VD_AGENT_FILE_XFER_STATUS_SUCCESS)
        .await;

    // one success plus one cancellation still succeeds
    copy.await.unwrap().unwrap();
}

#[tokio::test]
async fn copy_requires_a_connected_agent() {
    let (mut guest, running) = FakeGuest::start(SessionConfig::default()).await;
    guest.send_init(100, false).await;

    let file = temp_file(b"nope");
    let result = running
        .handle
        .copy_files(vec![file.path().to_path_buf()], None, None)
        .await;

    assert_eq!(result, Err(CopyError::AgentNotConnected));
}

#[tokio::test]
async fn copy_respects_the_disabled_capability() {
    let caps = caps_words(&[VD_AGENT_CAP_FILE_XFER_DISABLED]);
    let (_guest, running) = connect_with_caps(SessionConfig::default(), 100, &caps).await;

    let file = temp_file(b"nope");
    let result = running
        .handle
        .copy_files(vec![file.path().to_path_buf()], None, None)
        .await;

    assert_eq!(result, Err(CopyError::Disabled));
}

#[tokio::test]
async fn empty_file_list_resolves_immediately() {
    let (_guest, running) =
        connect_with_caps(SessionConfig::default(), 100, &caps_words(&[])).await;

    let result = running.handle.copy_files(Vec::new(), None, None).await;

    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn agent_disconnect_fails_pending_transfers() {
    let file = temp_file(&vec![3u8; 1024]);
    let (mut guest, running) =
        connect_with_caps(SessionConfig::default(), 1000, &caps_words(&[])).await;

    let copy = spawn_copy(&running, &file, None, None);
    guest.expect_agent_msg(VD_AGENT_FILE_XFER_START).await;

    // never grant the go-ahead; yank the agent instead
    guest
        .write_frame(SPICE_MSG_MAIN_AGENT_DISCONNECTED, &[])
        .await;

    let result = copy.await.unwrap();
    assert_eq!(
        result,
        Err(CopyError::Failed {
            num_files: 1,
            succeed: 0,
            cancelled: 0,
            failed: 1,
        })
    );
}
