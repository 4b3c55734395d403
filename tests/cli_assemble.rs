mod common;

use common::Fixture;
use predicates::prelude::*;

const PAGE: &str = "3fb20c92-9515-420b-ab5e-6de221b89e99";
const BOOK: &str = "00000000-0000-0000-0000-000000000000";

fn fixture() -> anyhow::Result<Fixture> {
    let mut fixture = Fixture::new()?;
    fixture.module("m42119", PAGE, "Intro", "<para>Hello.</para>")?;
    fixture.book("physics", BOOK, "Physics", &["m42119"])?;
    Ok(fixture)
}

#[test]
fn assemble_writes_book_and_prints_path() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cnxbook");
    cmd.arg("assemble")
        .arg("--container")
        .arg(fixture.root())
        .arg("--out")
        .arg(fixture.out())
        .assert()
        .success()
        .stdout(predicate::str::contains("physics.assembled.xhtml"));

    assert!(fixture.out().join("physics.assembled.xhtml").is_file());
    assert!(fixture.out().join("physics.toc-metadata.json").is_file());
    Ok(())
}

#[test]
fn existing_output_exits_3() -> anyhow::Result<()> {
    let fixture = fixture()?;
    std::fs::create_dir_all(fixture.out())?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cnxbook");
    cmd.arg("assemble")
        .arg("--container")
        .arg(fixture.root())
        .arg("--out")
        .arg(fixture.out())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("output already exists"));
    Ok(())
}

#[test]
fn missing_container_exits_4() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cnxbook");
    cmd.arg("assemble")
        .arg("--container")
        .arg(fixture.root())
        .arg("--out")
        .arg(fixture.out())
        .assert()
        .code(4)
        .stderr(predicate::str::contains("missing content"));
    Ok(())
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cnxbook");
    cmd.env("RUST_LOG", "debug")
        .arg("assemble")
        .arg("--container")
        .arg(fixture.root())
        .arg("--out")
        .arg(fixture.out())
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
