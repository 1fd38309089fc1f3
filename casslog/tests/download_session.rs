//! End-to-end download sessions against the simulated logger.

use {
    casslog::{
        CHUNK_SIZE, Error, METADATA_FILE, ProtocolEngine, TransferConfig, download_all,
        negotiate,
        port::sim::{IdentifyMode, SimDevice},
        session::NegotiationConfig,
    },
    std::{fs, time::Duration},
    tempfile::tempdir,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quick_negotiation() -> NegotiationConfig {
    NegotiationConfig {
        timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn negotiated_session_downloads_whole_chunks_and_metadata() {
    init_logging();
    let root = tempdir().unwrap();
    let a = pattern(10240, 1);
    let b = pattern(7000, 2);
    let device = SimDevice::new()
        .with_command_first(false)
        .with_file("A", a.clone())
        .with_file("B", b.clone())
        .with_firmware_version("cass_i2c_1_v2")
        .with_device_id("CASS-0107");

    let (first, second) = device.ports();
    let mut session = negotiate(first, second, &quick_negotiation()).unwrap();
    let mut engine = ProtocolEngine::new(&mut session);

    let summary = download_all(&mut engine, root.path(), &TransferConfig::default())
        .unwrap()
        .expect("device has files");
    drop(engine);
    drop(session);

    assert!(device.all_closed());
    assert_eq!(device.chunk_requests(), 3);

    let requested: Vec<u64> = summary.reports.iter().map(|r| r.requested_chunks).collect();
    assert_eq!(requested, vec![2, 1]);

    let dir = &summary.directory;
    assert!(
        dir.file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tmp_")
    );
    assert_eq!(fs::read(dir.join("A")).unwrap(), a);
    assert_eq!(fs::read(dir.join("B")).unwrap(), b[..CHUNK_SIZE]);

    let metadata = fs::read_to_string(dir.join(METADATA_FILE)).unwrap();
    assert!(metadata.contains("Firmware Ver: cass_i2c_1_v2"));
    assert!(metadata.contains("Device ID: CASS-0107"));

    let mut entries: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["A", "B", METADATA_FILE]);
}

#[test]
fn stalled_chunk_is_recovered_inside_a_full_download() {
    init_logging();
    let root = tempdir().unwrap();
    let a = pattern(3 * CHUNK_SIZE, 9);
    let device = SimDevice::new().with_file("A", a.clone()).stall_chunk(2, 1);

    let mut session = device.session();
    let mut engine = ProtocolEngine::new(&mut session);
    let summary = download_all(&mut engine, root.path(), &TransferConfig::default())
        .unwrap()
        .unwrap();

    assert_eq!(summary.reports[0].resumes, 1);
    assert_eq!(summary.reports[0].shortfall, 0);
    assert_eq!(fs::read(summary.directory.join("A")).unwrap(), a);
}

#[test]
fn unrecoverable_stall_aborts_download_and_closes_links() {
    init_logging();
    let root = tempdir().unwrap();
    let device = SimDevice::new()
        .with_file("A", pattern(2 * CHUNK_SIZE, 3))
        .stall_chunk(1, 2);

    let (first, second) = device.ports();
    let result = {
        let mut session = negotiate(first, second, &quick_negotiation()).unwrap();
        let mut engine = ProtocolEngine::new(&mut session);
        download_all(&mut engine, root.path(), &TransferConfig::default())
    };

    assert!(matches!(
        result,
        Err(Error::ResumeFailed {
            chunk_index: 1,
            offset: 5120,
            ..
        })
    ));
    assert!(device.all_closed());
}

#[test]
fn silent_device_fails_negotiation_before_any_transfer() {
    init_logging();
    let device = SimDevice::new()
        .with_file("A", pattern(CHUNK_SIZE, 0))
        .with_identify_mode(IdentifyMode::Silent);

    let (first, second) = device.ports();
    let result = negotiate(first, second, &quick_negotiation());

    assert!(matches!(result, Err(Error::HandshakeTimeout { .. })));
    assert_eq!(device.chunk_requests(), 0);
    assert!(device.all_closed());
}

#[test]
fn downloaded_log_decodes_with_firmware_from_metadata() {
    init_logging();
    let root = tempdir().unwrap();
    // Two std records of 76 bytes each: ticks 1000 and 3000, channels zero
    let mut log = vec![0u8; 2 * 76];
    log[..4].copy_from_slice(&1000u32.to_le_bytes());
    log[76..80].copy_from_slice(&3000u32.to_le_bytes());
    log.resize(CHUNK_SIZE, 0);

    let device = SimDevice::new()
        .with_file("LOG", log)
        .with_firmware_version("std-1.4");
    let mut session = device.session();
    let mut engine = ProtocolEngine::new(&mut session);
    let summary = download_all(&mut engine, root.path(), &TransferConfig::default())
        .unwrap()
        .unwrap();

    let table =
        casslog::decode_file(&summary.directory.join("LOG"), &summary.firmware_version).unwrap();
    // 5120 bytes hold 67 whole records; the rest are zero-filled
    assert_eq!(table.len(), CHUNK_SIZE / 76);
    let ticks = table.column("tmicros").and_then(|c| c.as_ints()).unwrap();
    assert_eq!(&ticks[..2], &[0, 2000]);
    assert_eq!(table.column_names()[..2], ["tmicros", "t"]);
}
