//! End-to-end programming sessions against the simulated peer

use stkbridge_core::config::SessionConfig;
use stkbridge_core::progress::{ProgressObserver, ProgressSnapshot};
use stkbridge_core::{Error, ProgrammingSession, ProgrammingState};
use stkbridge_sim::{Faults, PeerMode, SimConfig, SimulatedPeer};

#[derive(Default)]
struct Recorder {
    snapshots: Vec<ProgressSnapshot>,
}

impl ProgressObserver for Recorder {
    fn on_update(&mut self, snapshot: &ProgressSnapshot) {
        self.snapshots.push(snapshot.clone());
    }
}

type Session = ProgrammingSession<SimulatedPeer, Recorder>;

fn session(peer: SimulatedPeer) -> Session {
    session_with(peer, SessionConfig::default())
}

fn session_with(peer: SimulatedPeer, config: SessionConfig) -> Session {
    ProgrammingSession::with_observer(peer, config, Recorder::default()).unwrap()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Feed `data` in `chunk` sized pieces, polling in between, until the
/// session finishes or `limit` polls have passed
fn upload(session: &mut Session, data: &[u8], chunk: usize, limit: usize) -> ProgrammingState {
    session.start(data.len()).unwrap();
    let mut offset = 0;
    let mut ended = false;
    for _ in 0..limit {
        if offset < data.len() {
            let end = (offset + chunk).min(data.len());
            match session.feed(&data[offset..end]) {
                Ok(taken) => offset += taken,
                Err(_) => break,
            }
        } else if !ended {
            if session.end_upload().is_err() {
                break;
            }
            ended = true;
        }

        let state = session.poll();
        if state.is_terminal() {
            return state;
        }
    }
    session.state()
}

fn poll_until_terminal(session: &mut Session) -> ProgrammingState {
    for _ in 0..100_000 {
        let state = session.poll();
        if state.is_terminal() {
            return state;
        }
    }
    session.state()
}

#[test]
fn test_flash_full_image() {
    let data = image(2048);
    let mut s = session(SimulatedPeer::new_default());

    assert_eq!(upload(&mut s, &data, 64, 100_000), ProgrammingState::Complete);
    // Page 0 is erased first and written last
    assert_eq!(s.link().page_writes(), 17);
    assert_eq!(s.pages_written(), 16);
    assert_eq!(&s.link().flash()[..2048], &data[..]);

    let progress = s.progress();
    assert_eq!(progress.bytes_written, 2048);
    assert_eq!(progress.percent_complete, 100.0);
    assert!(progress.error_message.is_empty());

    // One update per page, strictly increasing
    let written: Vec<usize> = s
        .observer()
        .snapshots
        .iter()
        .filter(|p| p.state == ProgrammingState::Uploading && p.bytes_written > 0)
        .map(|p| p.bytes_written)
        .collect();
    let expected: Vec<usize> = (1..=16).map(|n| n * 128).collect();
    assert_eq!(written, expected);

    let states: Vec<ProgrammingState> = s.observer().snapshots.iter().map(|p| p.state).collect();
    assert_eq!(states.first(), Some(&ProgrammingState::Connecting));
    assert!(states.contains(&ProgrammingState::Verifying));
    assert_eq!(states.last(), Some(&ProgrammingState::Complete));
}

#[test]
fn test_partial_final_page_is_padded() {
    let data = image(300);
    let old = vec![0x42; 1024];
    let mut s = session(SimulatedPeer::new_default().with_firmware(&old));

    assert_eq!(upload(&mut s, &data, 13, 100_000), ProgrammingState::Complete);
    assert_eq!(s.link().page_writes(), 4);

    let flash = s.link().flash();
    assert_eq!(&flash[..300], &data[..]);
    assert!(flash[300..384].iter().all(|&b| b == 0x00));
    // Pages past the image are untouched
    assert_eq!(flash[384], 0x42);
    assert_eq!(s.progress().bytes_written, 300);
}

#[test]
fn test_round_trip_matches_image() {
    let data = image(5000);
    let mut s = session(SimulatedPeer::new_default());
    assert_eq!(upload(&mut s, &data, 1500, 200_000), ProgrammingState::Complete);
    assert_eq!(s.link().page_writes(), 41);
    assert_eq!(&s.link().flash()[..5000], &data[..]);
}

#[test]
fn test_client_disconnect_mid_upload() {
    let data = image(2048);
    let mut s = session(SimulatedPeer::new_default());
    s.start(data.len()).unwrap();

    let mut offset = 0;
    while offset < 512 {
        offset += s.feed(&data[offset..offset + 64]).unwrap();
        s.poll();
    }
    for _ in 0..2000 {
        s.poll();
    }
    let resets_before = s.link().reset_count();

    s.abort();
    assert_eq!(s.state(), ProgrammingState::Error);
    assert_eq!(s.progress().error, Some(Error::UploadAborted));
    let written = s.progress().bytes_written;
    assert!(written <= 512);
    assert_eq!(written % 128, 0);
    assert_eq!(s.pages_written() * 128, written);
    let writes = s.link().page_writes();

    // Further bytes are refused and nothing more is written
    assert_eq!(s.feed(&data[512..576]), Err(Error::UploadAborted));
    s.poll();
    assert_eq!(s.link().page_writes(), writes);
    assert!(!s.link().has_application());

    // Parked in the bootloader rather than booting a partial image
    assert_eq!(s.link().reset_count(), resets_before + 1);
    assert_eq!(s.link().mode(), PeerMode::Bootloader);

    s.reset().unwrap();
    assert_eq!(s.state(), ProgrammingState::Idle);
    assert_eq!(upload(&mut s, &data, 256, 100_000), ProgrammingState::Complete);
}

#[test]
fn test_silent_peer_keeps_old_firmware() {
    let old = image(1024);
    let peer = SimulatedPeer::new_default()
        .with_firmware(&old)
        .with_faults(Faults {
            silent: true,
            ..Default::default()
        });
    let mut s = session(peer);

    assert_eq!(upload(&mut s, &image(512), 128, 100_000), ProgrammingState::Error);
    assert_eq!(s.progress().error, Some(Error::HandshakeTimeout));
    assert_eq!(s.progress().bytes_written, 0);
    assert_eq!(s.link().page_writes(), 0);
    assert_eq!(&s.link().flash()[..1024], &old[..]);
    assert!(!s.progress().error_message.is_empty());
}

#[test]
fn test_handshake_retries() {
    let peer = SimulatedPeer::new_default().with_faults(Faults {
        ignore_syncs: 2,
        ..Default::default()
    });
    let mut s = session(peer);
    assert_eq!(upload(&mut s, &image(256), 256, 100_000), ProgrammingState::Complete);
}

#[test]
fn test_signature_mismatch() {
    let peer = SimulatedPeer::new(SimConfig {
        signature: [0x1E, 0x95, 0x14],
        ..Default::default()
    });
    let mut s = session(peer);

    assert_eq!(upload(&mut s, &image(256), 256, 100_000), ProgrammingState::Error);
    assert_eq!(
        s.progress().error,
        Some(Error::SignatureMismatch {
            expected: [0x1E, 0x95, 0x0F],
            found: [0x1E, 0x95, 0x14],
        })
    );
    assert_eq!(s.link().page_writes(), 0);
}

#[test]
fn test_corrupted_write_fails_verification() {
    let peer = SimulatedPeer::new_default().with_faults(Faults {
        corrupt_byte: Some(300),
        ..Default::default()
    });
    let mut s = session(peer);

    assert_eq!(upload(&mut s, &image(1024), 128, 100_000), ProgrammingState::Error);
    assert!(matches!(
        s.progress().error,
        Some(Error::ChecksumMismatch { .. })
    ));
    assert_eq!(s.link().page_writes(), 9);
    assert!(s.link().has_application());

    // The complete but corrupt image loses its reset vector before parking
    let resets_before = s.link().reset_count();
    s.poll();
    assert_eq!(s.link().reset_count(), resets_before + 1);
    assert!(s.link().flash()[..128].iter().all(|&b| b == 0xFF));

    s.link_mut().unwrap().advance(1500);
    assert_eq!(s.link().mode(), PeerMode::Bootloader);
}

#[test]
fn test_peer_drops_off_mid_write() {
    let peer = SimulatedPeer::new_default().with_faults(Faults {
        fail_after_pages: Some(3),
        ..Default::default()
    });
    let mut s = session(peer);

    assert_eq!(upload(&mut s, &image(1024), 128, 100_000), ProgrammingState::Error);
    assert!(s.progress().error.is_some_and(|e| e.is_timeout()));
    // The erase of page 0, then pages 1 and 2
    assert_eq!(s.progress().bytes_written, 256);
}

#[test]
fn test_interrupted_upload_never_boots_mixed_image() {
    let old = vec![0x42; 2048];
    let peer = SimulatedPeer::new_default()
        .with_firmware(&old)
        .with_faults(Faults {
            fail_after_pages: Some(3),
            ..Default::default()
        });
    let mut s = session(peer);

    assert_eq!(upload(&mut s, &image(1024), 128, 100_000), ProgrammingState::Error);
    s.poll();
    assert_eq!(s.link().mode(), PeerMode::Bootloader);

    // Well past the bootloader's own timeout
    s.link_mut().unwrap().advance(1500);
    assert_ne!(s.link().mode(), PeerMode::Application);
    assert!(!s.link().has_application());
    assert!(s.link().flash()[..128].iter().all(|&b| b == 0xFF));
    assert_eq!(&s.link().flash()[128..384], &image(1024)[128..384]);
    assert_eq!(s.link().flash()[384], 0x42);
}

#[test]
fn test_single_page_image_written_directly() {
    let data = image(100);
    let mut s = session(SimulatedPeer::new_default());
    assert_eq!(upload(&mut s, &data, 100, 100_000), ProgrammingState::Complete);
    assert_eq!(s.link().page_writes(), 1);
    assert_eq!(&s.link().flash()[..100], &data[..]);
}

#[test]
fn test_start_while_active_is_busy() {
    let data = image(1024);
    let mut s = session(SimulatedPeer::new_default());
    s.start(data.len()).unwrap();
    for _ in 0..50 {
        s.poll();
    }

    assert_eq!(s.start(128), Err(Error::Busy));
    assert!(s.state().is_active());
    assert_eq!(s.progress().bytes_total, 1024);

    let mut offset = 0;
    while offset < data.len() {
        offset += s.feed(&data[offset..]).unwrap();
        s.poll();
    }
    s.end_upload().unwrap();
    assert_eq!(poll_until_terminal(&mut s), ProgrammingState::Complete);
    assert_eq!(&s.link().flash()[..1024], &data[..]);
}

#[test]
fn test_keepalive_holds_bootloader() {
    let data = image(512);
    let mut s = session(SimulatedPeer::new_default());
    s.start(data.len()).unwrap();

    // A slow uploader: far longer than the bootloader's own timeout
    for piece in data.chunks(128) {
        assert_eq!(s.feed(piece).unwrap(), 128);
        for _ in 0..800 {
            s.poll();
        }
    }
    s.end_upload().unwrap();

    assert_eq!(poll_until_terminal(&mut s), ProgrammingState::Complete);
    assert_eq!(&s.link().flash()[..512], &data[..]);
}

#[test]
fn test_stalled_upload_times_out() {
    let mut config = SessionConfig::default();
    config.timing.upload_idle_timeout_ms = 500;
    let data = image(1024);
    let mut s = session_with(SimulatedPeer::new_default(), config);

    s.start(data.len()).unwrap();
    s.feed(&data[..200]).unwrap();

    assert_eq!(poll_until_terminal(&mut s), ProgrammingState::Error);
    assert_eq!(s.progress().error, Some(Error::UploadAborted));
    // Only the early erase of page 0 reached the peer
    assert_eq!(s.link().page_writes(), 1);
    assert_eq!(s.pages_written(), 0);
}

#[test]
fn test_overrun_fails_session() {
    let mut s = session(SimulatedPeer::new_default());
    s.start(100).unwrap();
    assert_eq!(s.feed(&image(101)), Err(Error::UploadOverrun));
    assert_eq!(s.state(), ProgrammingState::Error);
}

#[test]
fn test_short_upload_aborts() {
    let mut s = session(SimulatedPeer::new_default());
    s.start(256).unwrap();
    s.feed(&image(100)).unwrap();
    assert_eq!(s.end_upload(), Err(Error::UploadAborted));
    assert_eq!(s.state(), ProgrammingState::Error);
}

#[test]
fn test_relay_reaches_application() {
    let mut s = session(SimulatedPeer::new_default());
    s.relay(b"{\"led\":1}").unwrap();
    assert_eq!(s.link().relayed(), b"{\"led\":1}");
}
