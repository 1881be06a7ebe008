//! End-to-end tests of the `tenancy` binary against a file-backed SQLite database.

use assert_cmd::Command;
use tempfile::TempDir;

fn tenancy_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tenancy").expect("binary builds");
    cmd.current_dir(dir.path())
        .env(
            "TENANCY_DATABASE_URL",
            format!("sqlite://{}/tenancy.db?mode=rwc", dir.path().display()),
        )
        .env("TENANCY_LOG_LEVEL", "warn")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("command runs");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn creates_lists_and_deletes_tenants() {
    let dir = TempDir::new().unwrap();

    let created = stdout_of(tenancy_cmd(&dir).args(["create-tenant", "acme"]));
    assert!(created.starts_with("Created tenant acme ("), "{created}");
    let id = created
        .trim()
        .trim_start_matches("Created tenant acme (")
        .trim_end_matches(')')
        .to_string();

    let listed = stdout_of(tenancy_cmd(&dir).arg("list-tenants"));
    assert_eq!(listed.trim(), format!("{id}\tacme"));

    let deleted = stdout_of(tenancy_cmd(&dir).args(["delete-tenant", &id]));
    assert_eq!(deleted.trim(), format!("Deleted tenant {id}"));

    let listed = stdout_of(tenancy_cmd(&dir).arg("list-tenants"));
    assert!(listed.trim().is_empty());
}

#[test]
fn migrate_reports_success() {
    let dir = TempDir::new().unwrap();
    let output = stdout_of(tenancy_cmd(&dir).arg("migrate"));
    assert_eq!(output.trim(), "Migrations applied.");
}

#[test]
fn too_many_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    let output = tenancy_cmd(&dir)
        .args(["create-tenant", "acme", "extra"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(
            "Number of args exceeds the number of fields for model tenancy.Tenant.\n\
             Got [\"acme\", \"extra\"] when defined fields are [\"name\"]."
        ),
        "{stderr}"
    );
}

#[test]
fn blank_tenant_name_is_reported() {
    let dir = TempDir::new().unwrap();
    let output = tenancy_cmd(&dir).arg("create-tenant").output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Invalid value for field \"name\": This field cannot be blank."),
        "{stderr}"
    );
}

#[test]
fn deleting_a_missing_tenant_fails() {
    let dir = TempDir::new().unwrap();
    let output = tenancy_cmd(&dir)
        .args(["delete-tenant", "7f1c1a2e-0000-4000-8000-000000000000"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}
