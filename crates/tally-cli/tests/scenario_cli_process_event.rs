use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::prelude::*;
use predicates::prelude::*;

const MEMORY_CONFIG: &str = r#"
store:
  backend: "memory"
reconcile:
  policy: "incremental"
  rate: "2.5"
"#;

const SCENARIO_ONE: &str = r#"{
  "id": "order-1001",
  "paymentStatus": "paid",
  "lineItems": [
    { "entityId": "789", "quantity": 25, "unitPrice": "1.00" },
    { "entityId": "456", "quantity": 50, "unitPrice": "1.00" },
    { "entityId": "789", "quantity": 10, "unitPrice": "1.00" }
  ]
}"#;

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).expect("write fixture");
    p
}

/// `tally` run from inside `dir`, isolated from any local env/config.
fn tally(dir: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::cargo_bin("tally").expect("binary built");
    cmd.current_dir(dir)
        .env_remove("TALLY_CONFIG")
        .env_remove("SHOPIFY_ADMIN_API_ACCESS_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn process_prints_per_entity_totals() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(dir.path(), "memory.yaml", MEMORY_CONFIG);
    let event = write(dir.path(), "event.json", SCENARIO_ONE);

    tally(dir.path())
        .args(["process", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("event_id=order-1001"))
        .stdout(predicate::str::contains("status=processed"))
        .stdout(predicate::str::contains("processed_count=2"))
        .stdout(predicate::str::contains("failure_count=0"))
        .stdout(predicate::str::contains(
            "total entity_id=456 units=50 contribution=125 new_total=125",
        ))
        .stdout(predicate::str::contains(
            "total entity_id=789 units=35 contribution=87.5 new_total=87.5",
        ));
    Ok(())
}

#[test]
fn process_adds_to_seeded_prior_total() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(dir.path(), "memory.yaml", MEMORY_CONFIG);
    let event = write(dir.path(), "event.json", SCENARIO_ONE);

    tally(dir.path())
        .args(["process", "--seed", "789=100", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("new_total=187.5"));
    Ok(())
}

#[test]
fn process_json_output_is_the_batch_result() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(dir.path(), "memory.yaml", MEMORY_CONFIG);
    let event = write(dir.path(), "event.json", SCENARIO_ONE);

    let out = tally(dir.path())
        .args(["process", "--json", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .output()?;
    assert!(out.status.success());

    let v: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(v["event_id"], "order-1001");
    assert_eq!(v["status"]["kind"], "processed");
    assert_eq!(v["processed_count"], 2);
    assert_eq!(v["totals"][1]["new_total"], "87.5");
    Ok(())
}

#[test]
fn unpaid_event_is_reported_as_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(dir.path(), "memory.yaml", MEMORY_CONFIG);
    let event = write(
        dir.path(),
        "event.json",
        r#"{ "id": 7, "paymentStatus": "refunded", "lineItems": [] }"#,
    );

    tally(dir.path())
        .args(["process", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("status=skipped"))
        .stdout(predicate::str::contains("processed_count=0"));
    Ok(())
}

#[test]
fn malformed_event_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(dir.path(), "memory.yaml", MEMORY_CONFIG);
    let event = write(dir.path(), "event.json", r#"{ "paymentStatus": "paid" }"#);

    tally(dir.path())
        .args(["process", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .assert()
        .failure()
        .stderr(predicate::str::contains("INGEST_FAILED"));
    Ok(())
}

#[test]
fn shopify_backend_without_token_refuses_to_boot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = write(
        dir.path(),
        "shopify.yaml",
        "store:\n  backend: \"shopify\"\n  shop_domain: \"example.myshopify.com\"\n",
    );
    let event = write(dir.path(), "event.json", SCENARIO_ONE);

    // No access token in the environment: boot refuses before anything runs.
    tally(dir.path())
        .args(["process", "--seed", "789=1", "--config"])
        .arg(&cfg)
        .arg("--event")
        .arg(&event)
        .assert()
        .failure()
        .stderr(predicate::str::contains("SECRETS_MISSING"));
    Ok(())
}
