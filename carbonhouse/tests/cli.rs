use assert_cmd::Command as AssertCmd;
use carbonhouse_rowbinary::{WriteBuffer, timestamp_to_days};
use pretty_assertions::assert_eq;

fn carbonhouse() -> AssertCmd {
    let mut cmd = AssertCmd::cargo_bin("carbonhouse").unwrap();
    cmd.env_remove("CARBONHOUSE_CONFIG");
    cmd
}

#[test]
fn version() {
    let output = carbonhouse().arg("version").assert().success().get_output().stdout.clone();
    assert!(String::from_utf8(output).unwrap().starts_with(env!("CARGO_PKG_VERSION")));
}

#[test]
fn default_config_passes_the_check() {
    let output = carbonhouse()
        .arg("print-default-config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("[upload.graphite_tree]"), "{text}");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carbonhouse.toml");
    std::fs::write(&path, text).unwrap();

    carbonhouse()
        .arg("-c")
        .arg(&path)
        .arg("check-config")
        .assert()
        .success();
}

#[test]
fn bad_config_fails_the_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carbonhouse.toml");
    std::fs::write(&path, "[common]\nmetric-endpoint = \"http://localhost:2003\"\n").unwrap();

    let stderr = carbonhouse()
        .arg("-c")
        .arg(&path)
        .arg("check-config")
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&stderr).contains("metric-endpoint"));

    carbonhouse()
        .args(["-c", "/nonexistent/carbonhouse.toml", "run"])
        .assert()
        .code(1);
}

#[test]
fn cat_and_recover() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("default.1");
    let mut wb = WriteBuffer::acquire();
    wb.write_graphite_point(b"a.b", 2.5, 86_400, timestamp_to_days(86_400), 9);
    let good = wb.as_bytes().to_vec();
    wb.write_graphite_point(b"c.d", 1.0, 86_400, timestamp_to_days(86_400), 9);
    let mut bytes = wb.as_bytes().to_vec();
    bytes.truncate(bytes.len() - 2);
    std::fs::write(&path, &bytes).unwrap();

    let recovered = carbonhouse()
        .arg("recover")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(recovered, good);

    std::fs::write(&path, &good).unwrap();
    carbonhouse()
        .arg("cat")
        .arg(&path)
        .assert()
        .success()
        .stdout("a.b\t2.5\t86400\t1970-01-02\t9\n");
}
