#![cfg(not(target_arch = "wasm32"))]

use std::fs;
use std::path::Path;

use tempfile::tempdir;

fn write_rom(path: &Path, signature: [u8; 2]) {
    let mut image = vec![0u8; 512];
    image[..2].copy_from_slice(&signature);
    image[2] = 1;
    let sum = image.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    image[511] = 0u8.wrapping_sub(sum);
    fs::write(path, image).unwrap();
}

fn write_descriptor(dir: &Path) -> String {
    let path = dir.join("device.json");
    fs::write(
        &path,
        r#"{
            "rom": "test.rom",
            "vendor_id": "0x1af4",
            "device_id": "1050",
            "class": "03",
            "bar1size": "0x4000"
        }"#,
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn prints_a_json_report() {
    let dir = tempdir().unwrap();
    write_rom(&dir.path().join("test.rom"), [0x55, 0xAA]);
    let descriptor = write_descriptor(dir.path());

    let output = assert_cmd::cargo::cargo_bin_cmd!("optrom-analyzer")
        .args(["-f", &descriptor, "--json", "--allocator", "window", "--bdf", "00:03.0"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["device"]["vendor_id"], 0x1AF4);
    assert_eq!(report["device"]["bdf"]["device"], 3);
    assert_eq!(report["device"]["bar_base"][1], 0xE000_4000u32);
    assert_eq!(report["probe"]["bars"][1]["size"], 0x4000);
    assert_eq!(report["probe"]["rom_base"], 0xE000_0000u32);
    assert_eq!(report["rom"]["declared_len"], 512);
}

#[test]
fn prints_a_text_summary() {
    let dir = tempdir().unwrap();
    write_rom(&dir.path().join("test.rom"), [0x55, 0xAA]);
    let descriptor = write_descriptor(dir.path());

    let output = assert_cmd::cargo::cargo_bin_cmd!("optrom-analyzer")
        .args(["-f", &descriptor, "--allocator", "window", "--window-base", "0xd0000000"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("1af4:1050"), "{text}");
    assert!(text.contains("BAR1 base 0xd0004000 size 0x4000"), "{text}");
}

#[test]
fn bad_signature_exits_with_status_1() {
    let dir = tempdir().unwrap();
    write_rom(&dir.path().join("test.rom"), [0x4D, 0x5A]);
    let descriptor = write_descriptor(dir.path());

    let assert = assert_cmd::cargo::cargo_bin_cmd!("optrom-analyzer")
        .args(["-f", &descriptor, "--allocator", "window"])
        .assert()
        .failure()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("not an option ROM"), "{stderr}");
    assert!(assert.get_output().stdout.is_empty());
}

#[test]
fn missing_descriptor_exits_with_status_1() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.json");

    let assert = assert_cmd::cargo::cargo_bin_cmd!("optrom-analyzer")
        .args(["-f", missing.to_str().unwrap()])
        .assert()
        .failure()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("file not found"), "{stderr}");
}

#[test]
fn missing_rom_field_exits_with_status_1() {
    let dir = tempdir().unwrap();
    let descriptor = dir.path().join("device.json");
    fs::write(&descriptor, r#"{ "vendor_id": "8086" }"#).unwrap();

    let assert = assert_cmd::cargo::cargo_bin_cmd!("optrom-analyzer")
        .args(["-f", descriptor.to_str().unwrap(), "--allocator", "window"])
        .assert()
        .failure()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("no \"rom\" entry"), "{stderr}");
}
