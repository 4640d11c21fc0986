//! Scenario: `tm config-hash` merges layers deterministically and refuses
//! secret literals.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;

fn hash_of(output: &[u8]) -> String {
    String::from_utf8_lossy(output)
        .lines()
        .find_map(|l| l.strip_prefix("config_hash=").map(str::to_string))
        .unwrap_or_default()
}

#[test]
fn layered_config_hash_is_stable_and_override_sensitive() -> anyhow::Result<()> {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .canonicalize()?;
    let base = repo_root.join("config").join("base.yaml");

    let dir = tempfile::tempdir()?;
    let overlay = dir.path().join("site.yaml");
    fs::write(&overlay, "query:\n  default_limit: 50\n")?;

    let run = |paths: &[&std::path::Path]| -> anyhow::Result<std::process::Output> {
        let mut cmd = std::process::Command::cargo_bin("tm")?;
        cmd.arg("config-hash").args(paths);
        Ok(cmd.output()?)
    };

    let a = run(&[&base])?;
    let b = run(&[&base])?;
    assert!(a.status.success(), "{}", String::from_utf8_lossy(&a.stderr));
    assert_eq!(hash_of(&a.stdout), hash_of(&b.stdout));
    assert_eq!(hash_of(&a.stdout).len(), 64);

    let c = run(&[&base, &overlay])?;
    assert!(c.status.success());
    assert_ne!(hash_of(&a.stdout), hash_of(&c.stdout));
    assert!(String::from_utf8_lossy(&c.stdout).contains("\"default_limit\":50"));
    Ok(())
}

#[test]
fn secret_literal_in_config_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = dir.path().join("bad.yaml");
    fs::write(&bad, "database:\n  url_env: \"postgres://u:p@h/db\"\n")?;

    let mut cmd = std::process::Command::cargo_bin("tm")?;
    cmd.arg("config-hash").arg(&bad);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("u:p@h").not());
    Ok(())
}
