/// Structural validation of the initial migration: string-checks the SQL
/// file for the tables/columns/constraints the store layer relies on.
/// Exercising the migration against a real Postgres is left to the
/// `testcontainers`-backed integration suite run in CI.
const MIGRATION_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/0001_init.sql");

fn read_migration() -> String {
    std::fs::read_to_string(MIGRATION_PATH)
        .expect("migration file should exist at crates/im-store/migrations/0001_init.sql")
}

#[test]
fn migration_file_exists_and_is_nonempty() {
    let sql = read_migration();
    assert!(!sql.trim().is_empty());
}

#[test]
fn all_five_tables_defined() {
    let sql = read_migration();
    for table in ["seq_conversations", "seq_users", "conversations", "messages", "user_timelines"] {
        assert!(
            sql.contains(&format!("CREATE TABLE {table}")),
            "migration must define {table} table"
        );
    }
}

#[test]
fn messages_unique_on_conversation_and_seq() {
    let sql = read_migration();
    assert!(
        sql.contains("UNIQUE (conversation_id, seq)"),
        "messages must be unique per (conversation_id, seq)"
    );
}

#[test]
fn messages_primary_key_is_id() {
    let sql = read_migration();
    let start = sql.find("CREATE TABLE messages").expect("messages table must exist");
    let end = sql[start..].find("CREATE TABLE").map(|i| start + i).unwrap_or(sql.len());
    assert!(sql[start..end].contains("id BIGINT PRIMARY KEY"));
}

#[test]
fn conversations_unique_on_user_and_conversation() {
    let sql = read_migration();
    assert!(sql.contains("UNIQUE (user_id, conversation_id)"));
}

#[test]
fn user_timelines_unique_on_owner_and_seq() {
    let sql = read_migration();
    assert!(sql.contains("UNIQUE (owner_id, seq)"));
}
