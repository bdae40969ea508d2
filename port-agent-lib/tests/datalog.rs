#![forbid(unsafe_code)]

use std::fs;

use chrono::Local;
use port_agent_lib::config::RotationInterval;
use port_agent_lib::publish::DataLog;
use tempfile::tempdir;

#[test]
fn explicit_filename_appends() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("capture.log");

    let mut log = DataLog::with_filename(&path);
    log.write(b"first").unwrap();
    log.write(b"|second").unwrap();
    log.flush();

    assert_eq!(fs::read(&path).unwrap(), b"first|second");
}

#[test]
fn derived_name_carries_date_stamp() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("port_agent_4000");

    let mut log = DataLog::with_base(&base, "data");
    log.write(b"record").unwrap();
    log.flush();

    let stamp = Local::now().format("%Y%m%d").to_string();
    let expected = dir.path().join(format!("port_agent_4000.{stamp}.data"));
    assert_eq!(fs::read(&expected).unwrap(), b"record");
}

#[test]
fn hourly_rotation_extends_stamp() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("hourly");

    let mut log = DataLog::with_base(&base, "data");
    log.set_rotation(RotationInterval::Hourly);

    let stamp = Local::now().format("%Y%m%d%H").to_string();
    assert_eq!(
        log.current_filename().unwrap(),
        dir.path().join(format!("hourly.{stamp}.data"))
    );
}

#[test]
fn reopens_after_unlink() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resilient.log");

    let mut log = DataLog::with_filename(&path);
    log.write(b"before").unwrap();
    log.flush();

    fs::remove_file(&path).unwrap();

    log.write(b"after").unwrap();
    log.flush();
    assert_eq!(fs::read(&path).unwrap(), b"after");
}

#[test]
fn append_never_truncates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.log");
    fs::write(&path, b"preexisting|").unwrap();

    let mut log = DataLog::with_filename(&path);
    log.write(b"appended").unwrap();
    log.flush();

    assert_eq!(fs::read(&path).unwrap(), b"preexisting|appended");
}
