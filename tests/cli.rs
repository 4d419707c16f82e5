use std::io::Write;
use std::process::{Command, Output};

fn namecrab(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_namecrab"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn missing_config_file_is_fatal() {
    let out = namecrab(&["-c", "/nonexistent/namecrab.json", "-f"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(
        stderr.starts_with("namecrab: loading configuration from /nonexistent/namecrab.json"),
        "{stderr}"
    );
    assert_eq!(stderr.lines().count(), 1);
}

#[test]
fn unknown_test_option_is_fatal() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    config.write_all(b"{}").unwrap();
    let path = config.path().to_str().unwrap();

    let out = namecrab(&["-c", path, "-g", "-T", "bogus"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("unrecognized test option 'bogus'"), "{stderr}");
}

#[test]
fn ipv4_and_ipv6_only_conflict() {
    let out = namecrab(&["-4", "-6"]);
    assert_eq!(out.status.code(), Some(2));
}
