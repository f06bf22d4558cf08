//! End-to-end transfer flow tests.
//!
//! These drive real requester sessions against either the real requested
//! side (over in-memory channels) or a hand-played harness that checks the
//! exact wire sequence.

mod common;

use std::sync::Arc;

use common::{
    make_runner, send_record, wait_for, wait_for_records, DuplexProvider, HarnessProvider,
    TestHost, TEST_KEY,
};
use ferry_core::blockfile::BlockFile;
use ferry_core::channel::PacketStream;
use ferry_core::packet::{
    content_key, AuthentPacket, DataPacket, EndRequestPacket, EndTransferPacket, Packet,
    PacketType, RequestPacket, StartupPacket, Way,
};
use ferry_core::record::{StepCode, TransferMode, TransferRecord, UpdatedInfo};
use ferry_core::session;
use ferry_core::store::TransferStore;

const BLOCK: u32 = 400;

/// Play the requested host for one send-mode transfer, recording what
/// arrives. Returns the observed packet tags and the reassembled payload.
async fn play_requested_side(mut stream: PacketStream) -> (Vec<String>, Vec<u8>) {
    let mut seen = Vec::new();
    let mut payload = Vec::new();
    loop {
        let packet = stream.read().await.expect("harness read");
        match packet {
            Packet::Startup(_) => seen.push("Startup".to_string()),
            Packet::Authent(a) => {
                assert_eq!(a.way, Way::Ask);
                seen.push("Authent(Ask)".to_string());
                stream
                    .write(&Packet::Authent(AuthentPacket {
                        host_id: "beta".to_string(),
                        key: TEST_KEY.as_bytes().to_vec(),
                        local_id: a.local_id,
                        way: Way::Answer,
                        version: String::new(),
                    }))
                    .await
                    .expect("authent answer");
            }
            Packet::Request(r) => {
                assert_eq!(r.way, Way::Ask);
                assert_eq!(r.rule, "backup");
                assert_eq!(r.rank, 0);
                seen.push("Request(Ask)".to_string());
            }
            Packet::Data(d) => {
                seen.push(format!("Data({})", d.rank));
                payload.extend_from_slice(&d.data);
            }
            Packet::EndTransfer(e) => {
                assert_eq!(e.way, Way::Ask);
                seen.push("EndTransfer(Ask)".to_string());
                stream
                    .write(&Packet::EndTransfer(EndTransferPacket {
                        request: PacketType::Request as u8,
                        way: Way::Answer,
                        digest: None,
                    }))
                    .await
                    .expect("end transfer answer");
            }
            Packet::EndRequest(e) => {
                assert_eq!(e.way, Way::Ask);
                seen.push("EndRequest(Ask)".to_string());
                stream
                    .write(&Packet::EndRequest(EndRequestPacket {
                        code: u32::from('O'),
                        way: Way::Answer,
                        optional: None,
                    }))
                    .await
                    .expect("end request answer");
                return (seen, payload);
            }
            other => panic!("unexpected packet from requester: {other}"),
        }
    }
}

#[tokio::test]
async fn test_happy_path_wire_sequence() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    let content = alpha.seed_file("data.bin", 1000); // 3 blocks of 400

    let (provider, mut servers) = HarnessProvider::new();
    let runner = make_runner(&alpha, Arc::new(provider));

    let harness = tokio::spawn(async move {
        let stream = servers.recv().await.expect("dialed channel");
        play_requested_side(stream).await
    });

    let outcome = runner
        .run_direct(send_record("alpha", "beta", "data.bin", BLOCK))
        .await
        .expect("transfer runs");
    assert!(outcome.success);
    assert_eq!(outcome.final_rank, 3);

    let (seen, payload) = harness.await.expect("harness");
    assert_eq!(
        seen,
        vec![
            "Startup",
            "Authent(Ask)",
            "Request(Ask)",
            "Data(0)",
            "Data(1)",
            "Data(2)",
            "EndTransfer(Ask)",
            "EndRequest(Ask)",
        ]
    );
    assert_eq!(payload, content);

    let records = alpha.store.all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, UpdatedInfo::Done);
    assert_eq!(records[0].rank, 3);
}

#[tokio::test]
async fn test_send_end_to_end() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    let beta = TestHost::new("beta", &["alpha"], TransferMode::Send);
    let content = alpha.seed_file("data.bin", 1000);

    let runner = make_runner(&alpha, Arc::new(DuplexProvider::new(Arc::clone(&beta.ctx))));
    let outcome = runner
        .run_direct(send_record("alpha", "beta", "data.bin", BLOCK))
        .await
        .expect("transfer runs");
    assert!(outcome.success, "{}", outcome.message);

    let landed = beta.recv_dir.join("data.bin");
    wait_for(|| landed.exists(), "received file").await;
    assert_eq!(std::fs::read(&landed).unwrap(), content);

    let records = alpha.store.all().await.unwrap();
    assert_eq!(records[0].status, UpdatedInfo::Done);
    assert_eq!(records[0].rank, 3);

    wait_for_records(
        &beta.store,
        |records| {
            records
                .first()
                .is_some_and(|r| r.status == UpdatedInfo::Done && r.rank == 3)
        },
        "requested-side record finalized",
    )
    .await;
}

#[tokio::test]
async fn test_retrieve_end_to_end() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Recv);
    let beta = TestHost::new("beta", &["alpha"], TransferMode::Recv);
    let content = beta.seed_file("report.bin", 900);

    let runner = make_runner(&alpha, Arc::new(DuplexProvider::new(Arc::clone(&beta.ctx))));
    let record = TransferRecord::new(
        "backup",
        "alpha",
        "beta",
        TransferMode::Recv,
        "report.bin",
        BLOCK,
    );
    let outcome = runner.run_direct(record).await.expect("transfer runs");
    assert!(outcome.success, "{}", outcome.message);

    let landed = alpha.recv_dir.join("report.bin");
    wait_for(|| landed.exists(), "retrieved file").await;
    assert_eq!(std::fs::read(&landed).unwrap(), content);

    let records = alpha.store.all().await.unwrap();
    assert_eq!(records[0].status, UpdatedInfo::Done);
}

#[tokio::test]
async fn test_empty_file_transfers_cleanly() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    let beta = TestHost::new("beta", &["alpha"], TransferMode::Send);
    alpha.seed_file("empty.bin", 0);

    let runner = make_runner(&alpha, Arc::new(DuplexProvider::new(Arc::clone(&beta.ctx))));
    let outcome = runner
        .run_direct(send_record("alpha", "beta", "empty.bin", BLOCK))
        .await
        .expect("transfer runs");
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.final_rank, 0);

    let landed = beta.recv_dir.join("empty.bin");
    wait_for(|| landed.exists(), "received empty file").await;
    assert_eq!(std::fs::read(&landed).unwrap().len(), 0);
}

#[tokio::test]
async fn test_corrupted_block_ends_in_error_never_done() {
    let beta = TestHost::new("beta", &["alpha"], TransferMode::Send);

    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(session::serve_requested(
        PacketStream::new(Box::new(server)),
        Arc::clone(&beta.ctx),
    ));

    let mut stream = PacketStream::new(Box::new(client));
    stream
        .write(&Packet::Startup(StartupPacket { local_id: 1 }))
        .await
        .unwrap();
    stream
        .write(&Packet::Authent(AuthentPacket {
            host_id: "alpha".to_string(),
            key: TEST_KEY.as_bytes().to_vec(),
            local_id: 1,
            way: Way::Ask,
            version: String::new(),
        }))
        .await
        .unwrap();
    let answer = stream.read().await.unwrap();
    assert!(matches!(answer, Packet::Authent(a) if a.way == Way::Answer));

    stream
        .write(&Packet::Request(RequestPacket {
            rule: "backup".to_string(),
            mode: TransferMode::SendWithIntegrity,
            filename: "corrupt.bin".to_string(),
            block_size: BLOCK,
            rank: 0,
            special_id: 77,
            way: Way::Ask,
            code: 'i',
            original_size: 800,
            file_information: String::new(),
        }))
        .await
        .unwrap();

    // a block whose content key was computed over different bytes
    let mut block = DataPacket::with_key(0, vec![1u8; BLOCK as usize]);
    block.key = content_key(b"something else entirely");
    assert!(!block.is_key_valid());
    stream.write(&Packet::Data(block)).await.unwrap();

    let reply = stream.read().await.unwrap();
    assert!(
        matches!(reply, Packet::Error(_)),
        "expected an error report, got {reply}"
    );

    wait_for_records(
        &beta.store,
        |records| {
            records.first().is_some_and(|r| {
                r.status == UpdatedInfo::InError && r.step_code == StepCode::IntegrityError
            })
        },
        "record marked in error",
    )
    .await;

    // never finalized
    assert!(!beta.recv_dir.join("corrupt.bin").exists());
    for record in beta.store.all().await.unwrap() {
        assert_ne!(record.status, UpdatedInfo::Done);
    }
}

#[tokio::test]
async fn test_interrupt_then_resume_matches_baseline() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    let beta = TestHost::new("beta", &["alpha"], TransferMode::Send);
    let content = alpha.seed_file("data.bin", 1000);

    // interrupted first attempt: the harness takes blocks 0 and 1 into
    // beta's work file, then drops the channel. The tiny channel capacity
    // keeps the sender from running ahead of what the harness accepted.
    let (provider, mut servers) = HarnessProvider::with_capacity(16);
    let interrupt_runner = make_runner(&alpha, Arc::new(provider));
    let beta_work = beta.work_dir.clone();

    let harness = tokio::spawn(async move {
        let mut stream = servers.recv().await.expect("dialed channel");
        let mut work = None;
        loop {
            let packet = stream.read().await.expect("harness read");
            match packet {
                Packet::Startup(_) => {}
                Packet::Authent(a) => {
                    stream
                        .write(&Packet::Authent(AuthentPacket {
                            host_id: "beta".to_string(),
                            key: TEST_KEY.as_bytes().to_vec(),
                            local_id: a.local_id,
                            way: Way::Answer,
                            version: String::new(),
                        }))
                        .await
                        .expect("authent answer");
                }
                Packet::Request(_) => {
                    work = Some(
                        BlockFile::create_write(&beta_work, "data.bin", BLOCK)
                            .await
                            .expect("work file"),
                    );
                }
                Packet::Data(d) => {
                    let file = work.as_mut().expect("work file open");
                    file.write_block(&d.data).await.expect("write block");
                    if d.rank == 1 {
                        file.flush().await.expect("flush");
                        // connection dies here
                        return;
                    }
                }
                other => panic!("unexpected packet before interruption: {other}"),
            }
        }
    });

    let outcome = interrupt_runner
        .run_direct(send_record("alpha", "beta", "data.bin", BLOCK))
        .await
        .expect("attempt resolves");
    harness.await.expect("harness");
    assert!(!outcome.success);

    let interrupted = alpha.store.all().await.unwrap().remove(0);
    assert_eq!(interrupted.rank, 2, "two blocks were acknowledged");

    // resumed attempt against the real requested side
    let resume_runner = make_runner(&alpha, Arc::new(DuplexProvider::new(Arc::clone(&beta.ctx))));
    let outcome = resume_runner
        .run_transfer(interrupted)
        .await
        .expect("resume runs");
    assert!(outcome.success, "{}", outcome.message);

    let landed = beta.recv_dir.join("data.bin");
    wait_for(|| landed.exists(), "resumed file").await;
    assert_eq!(
        std::fs::read(&landed).unwrap(),
        content,
        "resumed content equals the uninterrupted baseline"
    );
}

#[tokio::test]
async fn test_resume_sends_only_blocks_past_the_restart_point() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    alpha.seed_file("data.bin", 1000);

    let (provider, mut servers) = HarnessProvider::new();
    let runner = make_runner(&alpha, Arc::new(provider));

    let harness = tokio::spawn(async move {
        let stream = servers.recv().await.expect("dialed channel");
        let mut ranks = Vec::new();
        let mut stream = stream;
        loop {
            let packet = stream.read().await.expect("harness read");
            match packet {
                Packet::Startup(_) => {}
                Packet::Authent(a) => {
                    stream
                        .write(&Packet::Authent(AuthentPacket {
                            host_id: "beta".to_string(),
                            key: TEST_KEY.as_bytes().to_vec(),
                            local_id: a.local_id,
                            way: Way::Answer,
                            version: String::new(),
                        }))
                        .await
                        .expect("authent answer");
                }
                Packet::Request(r) => assert_eq!(r.rank, 2, "resume point travels in the request"),
                Packet::Data(d) => ranks.push(d.rank),
                Packet::EndTransfer(_) => {
                    stream
                        .write(&Packet::EndTransfer(EndTransferPacket {
                            request: PacketType::Request as u8,
                            way: Way::Answer,
                            digest: None,
                        }))
                        .await
                        .expect("end transfer answer");
                }
                Packet::EndRequest(_) => {
                    stream
                        .write(&Packet::EndRequest(EndRequestPacket {
                            code: u32::from('O'),
                            way: Way::Answer,
                            optional: None,
                        }))
                        .await
                        .expect("end request answer");
                    return ranks;
                }
                other => panic!("unexpected packet: {other}"),
            }
        }
    });

    let mut record = send_record("alpha", "beta", "data.bin", BLOCK);
    record.rank = 2;
    let outcome = runner.run_direct(record).await.expect("transfer runs");
    assert!(outcome.success);

    let ranks = harness.await.expect("harness");
    assert_eq!(ranks, vec![2], "only blocks past the restart point resend");
}

#[tokio::test]
async fn test_self_request_is_refused_by_the_runner() {
    let alpha = TestHost::new("alpha", &["beta"], TransferMode::Send);
    alpha.seed_file("data.bin", 100);

    let runner = make_runner(&alpha, Arc::new(common::FailingProvider));
    let mut record = send_record("alpha", "alpha", "data.bin", BLOCK);
    record.special_id = alpha.store.insert(record.clone()).await.unwrap();

    let result = runner.run_transfer(record.clone()).await;
    assert!(result.is_err());

    let stored = alpha.store.select(record.special_id).await.unwrap().unwrap();
    assert_eq!(stored.status, UpdatedInfo::InError);
    assert_eq!(stored.step_code, StepCode::LoopSelfRequestedHost);
}
