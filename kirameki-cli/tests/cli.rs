use assert_cmd::Command;

#[test]
fn help_lists_up_and_down_subcommands() {
    let mut cmd = Command::cargo_bin("kirameki").unwrap();
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(output.contains("up"));
    assert!(output.contains("down"));
}

#[test]
fn missing_database_url_fails_fast() {
    let mut cmd = Command::cargo_bin("kirameki").unwrap();
    cmd.env_remove("DATABASE_URL");
    cmd.args(["up"]);
    cmd.assert().failure();
}

#[test]
fn unreadable_migrations_directory_is_reported() {
    let mut cmd = Command::cargo_bin("kirameki").unwrap();
    cmd.env("DATABASE_URL", "postgres://localhost/does_not_matter");
    cmd.args(["--migrations", "/nonexistent/path/for/kirameki/tests", "up"]);
    let assert = cmd.assert().failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains("error:"));
}

#[test]
fn down_accepts_a_negative_target() {
    // `-1` ("roll back everything") must reach the migrator, not be
    // rejected by clap as an unrecognized flag. Using an unreadable
    // migrations directory isolates argument parsing from needing a
    // real database: a pre-clap rejection prints "unexpected argument",
    // while reaching the migrator fails on the directory instead.
    let mut cmd = Command::cargo_bin("kirameki").unwrap();
    cmd.env("DATABASE_URL", "postgres://localhost/does_not_matter");
    cmd.args(["--migrations", "/nonexistent/path/for/kirameki/tests", "down", "-1"]);
    let assert = cmd.assert().failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(!stderr.contains("unexpected argument"));
    assert!(stderr.contains("error:"));
}
