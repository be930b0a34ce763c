//! End-to-end transfers: sender and receiver engines wired over in-memory
//! pipes, with lossy, delayed, and adversarial variants in between.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use common::{ack_index, channel_pair, chunk_index, test_bytes};
use pindrop_protocol::CHUNK_SIZE;
use pindrop_protocol::control::{
    ControlAction, ControlMessage, FileMeta, decode_control, encode_control,
};
use pindrop_protocol::frame::encode_chunk;
use pindrop_transfer::{
    FileReceiver, FileSender, MemorySource, PipeFrame, ReceiveError, ReceiveOutcome, SendError,
    SendOutcome, SendRequest, SinkError, SinkOutput, TransferConfig, TransferStatus,
    checksum_bytes,
};

fn request(name: &str) -> SendRequest {
    SendRequest {
        name: name.into(),
        mime_type: "application/octet-stream".into(),
        checksum: None,
    }
}

/// Runs a transfer over directly wired pipes and returns both outcomes.
async fn run_transfer(data: Vec<u8>, config: TransferConfig) -> (SendOutcome, ReceiveOutcome) {
    let (sender_tp, receiver_inbound) = channel_pair();
    let (receiver_tp, sender_inbound) = channel_pair();

    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(sender_tp, sender_inbound, MemorySource::new(data), config);
    let sent = sender.send(request("transfer.bin")).await.unwrap();
    let received = receive_task.await.unwrap().unwrap();
    (sent, received)
}

#[tokio::test]
async fn lossless_transfer_four_chunks_four_acks() {
    let data = test_bytes(200_000);
    let config = TransferConfig::default();

    let (sender_tp, receiver_inbound) = channel_pair();

    // Interpose on receiver → sender to count ACK frames.
    let (receiver_tp, mut relay_rx) = channel_pair();
    let (sender_in_tx, sender_inbound) = mpsc::channel(4096);
    let acks = Arc::new(AtomicUsize::new(0));
    {
        let acks = Arc::clone(&acks);
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.recv().await {
                if ack_index(&frame).is_some() {
                    acks.fetch_add(1, Ordering::SeqCst);
                }
                if sender_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data.clone()),
        config,
    );
    let sent = sender.send(request("random.bin")).await.unwrap();

    // 200 000 bytes = 65 536 × 3 + 3 392.
    assert_eq!(sent.total_chunks, 4);
    assert_eq!(sent.bytes_sent, 200_000);
    assert_eq!(sent.retransmitted_chunks, 0);
    assert_eq!(acks.load(Ordering::SeqCst), 4);

    let received = receive_task.await.unwrap().unwrap();
    assert_eq!(received.bytes_received, 200_000);
    assert_eq!(received.meta.total_chunks, 4);
    match received.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test]
async fn dropped_chunk_recovers_via_nack() {
    let data = test_bytes(200_000);
    let config = TransferConfig {
        nack_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    // Drop the first delivery of chunk 2 on sender → receiver.
    let (sender_tp, mut s2r_rx) = channel_pair();
    let (r_in_tx, receiver_inbound) = mpsc::channel(4096);
    tokio::spawn(async move {
        let mut dropped = false;
        while let Some(frame) = s2r_rx.recv().await {
            if !dropped && chunk_index(&frame) == Some(2) {
                dropped = true;
                continue;
            }
            if r_in_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let (receiver_tp, sender_inbound) = channel_pair();
    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data.clone()),
        config,
    );
    let sent = sender.send(request("lossy.bin")).await.unwrap();
    assert!(sent.retransmitted_chunks >= 1);

    let received = receive_task.await.unwrap().unwrap();
    assert_eq!(received.bytes_received, 200_000);
    match received.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test(start_paused = true)]
async fn window_bounds_outstanding_under_slow_acks() {
    let chunk = 64 * 1024;
    let data = test_bytes(10 * chunk);
    let config = TransferConfig {
        chunk_size: chunk,
        max_outstanding_bytes: 128 * 1024, // 2 chunks in flight
        ack_batch_size: 1,
        nack_timeout: Duration::from_secs(60),
        ..Default::default()
    };

    let sent_count = Arc::new(AtomicUsize::new(0));
    let acked_count = Arc::new(AtomicUsize::new(0));

    // sender → receiver: assert the 2-chunk bound as frames pass.
    let (sender_tp, mut s2r_rx) = channel_pair();
    let (r_in_tx, receiver_inbound) = mpsc::channel(4096);
    {
        let sent_count = Arc::clone(&sent_count);
        let acked_count = Arc::clone(&acked_count);
        tokio::spawn(async move {
            while let Some(frame) = s2r_rx.recv().await {
                if chunk_index(&frame).is_some() {
                    let sent = sent_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let acked = acked_count.load(Ordering::SeqCst);
                    assert!(
                        sent - acked <= 2,
                        "window exceeded: {sent} sent, {acked} acked"
                    );
                }
                if r_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    // receiver → sender: delay every ACK by 500 ms.
    let (receiver_tp, mut r2s_rx) = channel_pair();
    let (s_in_tx, sender_inbound) = mpsc::channel(4096);
    {
        let acked_count = Arc::clone(&acked_count);
        tokio::spawn(async move {
            while let Some(frame) = r2s_rx.recv().await {
                if ack_index(&frame).is_some() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    acked_count.fetch_add(1, Ordering::SeqCst);
                }
                if s_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data.clone()),
        config,
    );
    let started = tokio::time::Instant::now();
    let sent = sender.send(request("slow.bin")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(sent.total_chunks, 10);
    // 10 chunks through a 2-chunk window behind 500 ms ACKs: at least
    // five ACK round trips of wall clock.
    assert!(elapsed >= Duration::from_millis(2500), "too fast: {elapsed:?}");

    let received = receive_task.await.unwrap().unwrap();
    assert_eq!(received.bytes_received, data.len() as u64);
}

#[tokio::test]
async fn zero_byte_file_completes_immediately() {
    let (sent, received) = run_transfer(Vec::new(), TransferConfig::default()).await;
    assert_eq!(sent.total_chunks, 0);
    assert_eq!(sent.bytes_sent, 0);
    assert_eq!(received.bytes_received, 0);
    match received.output {
        SinkOutput::Assembled(bytes) => assert!(bytes.is_empty()),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test]
async fn exactly_one_chunk() {
    let data = test_bytes(CHUNK_SIZE);
    let (sent, received) = run_transfer(data.clone(), TransferConfig::default()).await;
    assert_eq!(sent.total_chunks, 1);
    match received.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test]
async fn chunk_size_plus_one_yields_one_byte_tail() {
    let data = test_bytes(CHUNK_SIZE + 1);
    let (sent, received) = run_transfer(data.clone(), TransferConfig::default()).await;
    assert_eq!(sent.total_chunks, 2);
    assert_eq!(received.bytes_received, (CHUNK_SIZE + 1) as u64);
    match received.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test]
async fn out_of_order_duplicates_and_noise() {
    let config = TransferConfig {
        chunk_size: 4,
        ack_batch_size: 1,
        ..Default::default()
    };
    let data = b"AAAABBBBCC".to_vec();
    let checksum = checksum_bytes(&data);

    let (receiver_tp, mut r2s_rx) = channel_pair();
    let (drive_tx, receiver_inbound) = mpsc::channel(64);
    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config);
    let receive_task = tokio::spawn(receiver.run());

    let meta = ControlMessage::FileMeta(FileMeta {
        name: "art.bin".into(),
        size: 10,
        mime_type: "application/octet-stream".into(),
        total_chunks: 3,
        checksum: Some(checksum),
    });
    let frames = vec![
        PipeFrame::Text(encode_control(&meta).unwrap()),
        PipeFrame::Binary(encode_chunk(2, b"CC")),
        PipeFrame::Text("not json {{{".into()),   // malformed control, dropped
        PipeFrame::Binary(vec![0, 0, 1]),         // malformed frame, dropped
        PipeFrame::Binary(encode_chunk(0, b"AAAA")),
        PipeFrame::Binary(encode_chunk(2, b"CC")), // duplicate, dropped
        PipeFrame::Binary(encode_chunk(7, b"XX")), // out of range, dropped
        PipeFrame::Binary(encode_chunk(1, b"BBBB")),
    ];
    for frame in frames {
        drive_tx.send(frame).await.unwrap();
    }

    let outcome = receive_task.await.unwrap().unwrap();
    assert_eq!(outcome.bytes_received, 10);
    match outcome.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }

    // Drain the receiver's upstream traffic.
    drop(drive_tx);
    let mut acks = Vec::new();
    let mut ready_count = 0;
    let mut complete = None;
    while let Some(frame) = r2s_rx.recv().await {
        if let Some(index) = ack_index(&frame) {
            acks.push(index);
        } else if let PipeFrame::Text(text) = &frame {
            match decode_control(text) {
                Ok(ControlMessage::Control {
                    action: ControlAction::Ready,
                }) => ready_count += 1,
                Ok(ControlMessage::TransferComplete {
                    success,
                    bytes_received,
                }) => complete = Some((success, bytes_received)),
                _ => {}
            }
        }
    }

    // One ACK per accepted chunk, in arrival order; the duplicate is
    // dropped silently and not re-acknowledged.
    assert_eq!(acks, vec![2, 0, 1]);
    assert_eq!(ready_count, 1);
    assert_eq!(complete, Some((true, 10)));
}

#[tokio::test]
async fn cancel_rejects_sender_and_fails_receiver() {
    let chunk = 1024;
    let config = TransferConfig {
        chunk_size: chunk,
        max_outstanding_bytes: 8 * chunk,
        ..Default::default()
    };
    let data = test_bytes(16 * chunk);
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("partial.bin");

    let (sender_tp, receiver_inbound) = channel_pair();

    // receiver → sender: swallow ACKs so the sender fills its window and
    // stalls; forward everything else (`ready` in particular).
    let (receiver_tp, mut r2s_rx) = channel_pair();
    let (s_in_tx, sender_inbound) = mpsc::channel(4096);

    let (mut receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    receiver.write_to(&out_path);
    let statuses: Arc<Mutex<Vec<TransferStatus>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let statuses = Arc::clone(&statuses);
        receiver.on_progress(Box::new(move |progress| {
            statuses.lock().unwrap().push(progress.status);
        }));
    }
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data),
        config,
    );
    let cancel = sender.cancellation_token();

    // Cancel once five chunks have been acknowledged as sent.
    let chunks_seen = Arc::new(AtomicUsize::new(0));
    {
        let chunks_seen = Arc::clone(&chunks_seen);
        tokio::spawn(async move {
            while let Some(frame) = r2s_rx.recv().await {
                if ack_index(&frame).is_some() {
                    let seen = chunks_seen.fetch_add(1, Ordering::SeqCst) + 1;
                    if seen == 5 {
                        cancel.cancel();
                    }
                    continue; // swallowed
                }
                if s_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let result = sender.send(request("cancelled.bin")).await;
    assert!(matches!(result, Err(SendError::Cancelled)));

    // The sender's side of the pipe is gone; the receiver observes
    // transport loss and fails, leaving the partial sink on disk.
    let receive_result = receive_task.await.unwrap();
    assert!(matches!(receive_result, Err(ReceiveError::TransportClosed)));
    assert!(out_path.exists(), "partial sink should be closed, not removed");
    assert_eq!(
        statuses.lock().unwrap().last(),
        Some(&TransferStatus::Failed)
    );
}

#[tokio::test]
async fn resume_skips_already_received_chunks() {
    let chunk = 1024;
    let config = TransferConfig {
        chunk_size: chunk,
        ..Default::default()
    };
    let data = test_bytes(4_000); // chunks 0–2 full, chunk 3 = 928 bytes

    // A previous session already wrote chunks 0 and 1.
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("resume.bin");
    std::fs::write(&out_path, &data[..2 * chunk]).unwrap();

    // sender → receiver: record which chunk indices actually travel.
    let (sender_tp, mut s2r_rx) = channel_pair();
    let (r_in_tx, receiver_inbound) = mpsc::channel(4096);
    let wire_indices: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let wire_indices = Arc::clone(&wire_indices);
        tokio::spawn(async move {
            while let Some(frame) = s2r_rx.recv().await {
                if let Some(index) = chunk_index(&frame) {
                    wire_indices.lock().unwrap().push(index);
                }
                if r_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let (receiver_tp, sender_inbound) = channel_pair();
    let (mut receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    receiver.write_to(&out_path);
    receiver.resume_from(vec![(0, 1)]);
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data.clone()),
        config,
    );
    let sent = sender.send(request("resume.bin")).await.unwrap();
    // Skipped chunks still count toward delivered bytes.
    assert_eq!(sent.bytes_sent, 4_000);

    let received = receive_task.await.unwrap().unwrap();
    assert_eq!(received.bytes_received, 4_000);
    assert!(matches!(received.output, SinkOutput::File));

    let indices = wire_indices.lock().unwrap();
    assert!(
        !indices.contains(&0) && !indices.contains(&1),
        "held chunks were resent: {indices:?}"
    );
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
}

#[tokio::test]
async fn checksum_mismatch_fails_receiver_only() {
    let data = test_bytes(10_000);
    let config = TransferConfig::default();

    let (sender_tp, receiver_inbound) = channel_pair();
    let (receiver_tp, sender_inbound) = channel_pair();

    let (receiver, _handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data),
        config,
    );
    let mut req = request("corrupt.bin");
    req.checksum = Some("0".repeat(64));

    // All chunks are acknowledged, so the sender completes; the receiver
    // rejects the assembled artifact.
    let sent = sender.send(req).await.unwrap();
    assert_eq!(sent.bytes_sent, 10_000);

    let receive_result = receive_task.await.unwrap();
    assert!(matches!(
        receive_result,
        Err(ReceiveError::Sink(SinkError::ChecksumMismatch { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn pause_stalls_transfer_and_resume_completes() {
    let chunk = 1024;
    let config = TransferConfig {
        chunk_size: chunk,
        max_outstanding_bytes: 2 * chunk,
        ack_batch_size: 1,
        nack_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let data = test_bytes(6 * chunk);

    // sender → receiver: 100 ms of latency per chunk frame.
    let (sender_tp, mut s2r_rx) = channel_pair();
    let (r_in_tx, receiver_inbound) = mpsc::channel(4096);
    let sent_count = Arc::new(AtomicUsize::new(0));
    {
        let sent_count = Arc::clone(&sent_count);
        tokio::spawn(async move {
            while let Some(frame) = s2r_rx.recv().await {
                if chunk_index(&frame).is_some() {
                    sent_count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if r_in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let (receiver_tp, sender_inbound) = channel_pair();
    let (receiver, handle) = FileReceiver::new(receiver_tp, receiver_inbound, config.clone());
    let receive_task = tokio::spawn(receiver.run());

    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(data.clone()),
        config,
    );
    let send_task = tokio::spawn(sender.send(request("paused.bin")));

    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.pause().await;
    // Let in-flight chunks land.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let at_pause = sent_count.load(Ordering::SeqCst);

    // The range snapshot reflects what has landed so far.
    let ranges = handle.received_ranges().await.unwrap();
    assert!(!ranges.is_empty());
    assert_eq!(ranges[0].0, 0);

    // A paused sender pushes nothing new, no matter how long we wait.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sent_count.load(Ordering::SeqCst), at_pause);
    assert!(!send_task.is_finished());
    assert!(!receive_task.is_finished());

    handle.resume().await;

    let sent = send_task.await.unwrap().unwrap();
    assert_eq!(sent.total_chunks, 6);
    let received = receive_task.await.unwrap().unwrap();
    assert_eq!(received.bytes_received, data.len() as u64);
    match received.output {
        SinkOutput::Assembled(bytes) => assert_eq!(bytes, data),
        SinkOutput::File => panic!("expected in-memory output"),
    }
}

#[tokio::test]
async fn send_on_closed_pipe_is_not_ready() {
    let (sender_tp, receiver_inbound) = channel_pair();
    drop(receiver_inbound); // peer is gone before we start

    let (_receiver_tp, sender_inbound) = channel_pair();
    let sender = FileSender::new(
        sender_tp,
        sender_inbound,
        MemorySource::new(test_bytes(100)),
        TransferConfig::default(),
    );
    let result = sender.send(request("nobody.bin")).await;
    assert!(matches!(result, Err(SendError::NotReady)));
}
