#![cfg(feature = "vgm")]

mod common;

use std::io::Write;

use common::*;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use vgm_apu_player::report::{block_group_report, write_csv};
use vgm_apu_player::scheduler::PlaybackOutcome;
use vgm_apu_player::trace::{load_bytes, load_file};
use vgm_apu_player::{
    scan, PlaybackSession, PlayerConfig, RepeatMode, StopSignal, TraceSource, VgmTrace,
};

/// Two samples, one per frame: 128 bytes at $C000 then 64 bytes at $C080
fn two_sample_commands() -> Vec<u8> {
    let mut commands = vgm_ram_write(0xC000, &sample_bytes(128, 0x20));
    commands.extend(vgm_apu_write(0x4012, 0));
    commands.extend(vgm_apu_write(0x4013, 8));
    commands.extend(vgm_apu_write(0x4015, 0x1F));
    commands.push(0x62);
    commands.extend(vgm_ram_write(0xC080, &sample_bytes(64, 0x50)));
    commands.extend(vgm_apu_write(0x4012, 2));
    commands.extend(vgm_apu_write(0x4013, 4));
    commands.extend(vgm_apu_write(0x4015, 0x1F));
    commands.push(0x62);
    commands.push(0x66);
    commands
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn vgz_file(data: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&gzip(data)).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn vgz_file_scans_into_block_groups() {
    let file = vgz_file(&vgm_file(&two_sample_commands(), None, 1470));
    let mut trace = load_file(file.path()).unwrap();
    assert_eq!(trace.header().total_samples, 1470);
    assert!(!trace.has_loop());

    let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
    assert_eq!(scanned.total_samples, 1470);
    assert_eq!(scanned.loop_time, None);
    assert_eq!(scanned.rejected_payloads, 0);

    let references = scanned.references.references();
    assert_eq!(references.len(), 2);
    assert_eq!((references[0].time, references[0].byte_len), (0, 128));
    assert_eq!((references[1].time, references[1].byte_len), (735, 64));
    assert_eq!(
        scanned.references.group(references[1].group).key().written_at,
        735
    );

    // Scanning rewinds the trace
    assert_eq!(trace.position(), VGM_DATA_OFFSET);
}

#[test]
fn vgz_file_plays_with_remapped_samples() {
    let file = vgz_file(&vgm_file(&two_sample_commands(), None, 1470));
    let trace = load_file(file.path()).unwrap();
    let config = PlayerConfig::default();
    let (apu, clock) = device(&config, 0);
    let mut session = PlaybackSession::new(trace, apu, clock, config).unwrap();

    assert_eq!(session.play().unwrap(), PlaybackOutcome::Finished);
    let apu = session.sink();
    assert_eq!(apu.writes_to(0x4012), vec![8, 10]);
    assert_eq!(apu.writes_to(0x4013), vec![8, 4]);
    assert_eq!(apu.slot_bytes(8, 128), sample_bytes(128, 0x20).as_slice());
    assert_eq!(apu.slot_bytes(10, 64), sample_bytes(64, 0x50).as_slice());
    assert_eq!(session.stats().preloaded_groups, 2);
}

#[test]
fn vgz_loop_replays_from_loop_point() {
    let mut commands = vgm_ram_write(0xC000, &sample_bytes(64, 0x01));
    commands.extend(vgm_apu_write(0x4012, 0));
    commands.extend(vgm_apu_write(0x4013, 4));
    commands.extend(vgm_apu_write(0x4015, 0x1F));
    commands.push(0x62);
    let loop_at = commands.len();
    commands.extend(vgm_apu_write(0x4012, 0));
    commands.extend(vgm_apu_write(0x4013, 4));
    commands.extend(vgm_apu_write(0x4015, 0x1F));
    commands.push(0x62);
    commands.push(0x66);

    let file = vgz_file(&vgm_file(&commands, Some(loop_at), 1470));
    let trace = load_file(file.path()).unwrap();
    assert!(trace.has_loop());

    let config = PlayerConfig::default();
    let (apu, clock) = device(&config, 0);
    let stop = StopSignal::new();
    let clock = StoppingClock::new(clock, stop.clone(), 4);
    let mut session = PlaybackSession::new(trace, apu, clock, config)
        .unwrap()
        .with_stop_signal(stop)
        .with_repeat(RepeatMode::Loop);

    assert_eq!(session.play().unwrap(), PlaybackOutcome::Stopped);
    let apu = session.sink();
    assert_eq!(apu.writes_to(0x4012), vec![8, 8, 8, 8]);
    assert_eq!(apu.bytes_transferred(), 64);
    assert_eq!(session.stats().loops, 2);
}

#[test]
fn plain_vgm_without_samples_plays_unchanged() {
    let mut commands = Vec::new();
    commands.extend(vgm_apu_write(0x4000, 0x3F));
    commands.extend(vgm_apu_write(0x4012, 0x05));
    commands.extend_from_slice(&[0x61, 0x10, 0x00]);
    commands.push(0x66);

    let trace = load_bytes(&vgm_file(&commands, None, 16)).unwrap();
    let config = PlayerConfig::default();
    let (apu, clock) = device(&config, 0);
    let mut session = PlaybackSession::new(trace, apu, clock, config).unwrap();

    assert!(!session.prepare().unwrap());
    session.play().unwrap();
    assert_eq!(session.sink().writes_to(0x4012), vec![0x05]);
    assert_eq!(session.stats().remapped_writes, 0);
    assert_eq!(session.sink().bytes_transferred(), 0);
}

#[test]
fn corrupt_gzip_is_rejected() {
    assert!(load_bytes(&[0x1F, 0x8B, 0x08, 0x00, 0x01, 0x02]).is_err());
    assert!(load_bytes(b"not a vgm file at all").is_err());
}

#[test]
fn block_groups_export_to_csv() {
    let mut trace: VgmTrace = load_bytes(&vgm_file(&two_sample_commands(), None, 1470)).unwrap();
    let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
    let rows = block_group_report(&scanned.references);

    let file = NamedTempFile::new().unwrap();
    write_csv(&rows, file.reopen().unwrap()).unwrap();
    let text = std::fs::read_to_string(file.path()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "0,0,$C000,0,1,2,128");
    assert_eq!(lines[2], "735,2,$C080,735,1,1,64");
}
