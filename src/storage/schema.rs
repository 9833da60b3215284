//! Schema for the coordination tables
//!
//! Both scripts are idempotent so every instance may run them at startup.

/// SQLite schema
///
/// Timestamps are stored as fixed-width RFC 3339 UTC text, which compares
/// correctly as strings.
pub const SQLITE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS loader_instances (
        loader_instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
        loader_instance_key TEXT NOT NULL UNIQUE,
        hostname TEXT NOT NULL,
        pid INTEGER NOT NULL,
        heartbeat_tstamp TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS bucket_paths (
        bucket_path_id INTEGER PRIMARY KEY AUTOINCREMENT,
        bucket_name TEXT NOT NULL,
        bucket_path TEXT NOT NULL,
        UNIQUE (bucket_name, bucket_path)
    );

    CREATE TABLE IF NOT EXISTS resource_bundles (
        resource_bundle_id INTEGER PRIMARY KEY AUTOINCREMENT,
        bucket_path_id INTEGER NOT NULL REFERENCES bucket_paths (bucket_path_id),
        object_name TEXT NOT NULL,
        object_size INTEGER NOT NULL,
        file_type TEXT NOT NULL,
        allocation_id INTEGER,
        loader_instance_id INTEGER REFERENCES loader_instances (loader_instance_id),
        load_started TEXT,
        load_completed TEXT,
        UNIQUE (bucket_path_id, object_name)
    );

    CREATE INDEX IF NOT EXISTS idx_resource_bundle_allocid
        ON resource_bundles (allocation_id);

    CREATE TABLE IF NOT EXISTS resource_types (
        resource_type_id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_type TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS logical_resources (
        logical_resource_id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_type_id INTEGER NOT NULL REFERENCES resource_types (resource_type_id),
        logical_id TEXT NOT NULL,
        resource_bundle_id INTEGER NOT NULL REFERENCES resource_bundles (resource_bundle_id),
        UNIQUE (resource_type_id, logical_id)
    );

    CREATE TABLE IF NOT EXISTS allocation_counter (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );

    INSERT OR IGNORE INTO allocation_counter (name, value) VALUES ('job_allocation_seq', 0);
"#;

/// PostgreSQL schema
pub const POSTGRES_SCHEMA: &str = r#"
    CREATE SEQUENCE IF NOT EXISTS job_allocation_seq START WITH 1 CACHE 1000;

    CREATE TABLE IF NOT EXISTS loader_instances (
        loader_instance_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        loader_instance_key VARCHAR(36) NOT NULL UNIQUE,
        hostname VARCHAR(64) NOT NULL,
        pid BIGINT NOT NULL,
        heartbeat_tstamp TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS bucket_paths (
        bucket_path_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        bucket_name VARCHAR(64) NOT NULL,
        bucket_path VARCHAR(256) NOT NULL,
        CONSTRAINT unq_bucket_paths_nmpth UNIQUE (bucket_name, bucket_path)
    );

    CREATE TABLE IF NOT EXISTS resource_bundles (
        resource_bundle_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        bucket_path_id BIGINT NOT NULL REFERENCES bucket_paths (bucket_path_id),
        object_name VARCHAR(64) NOT NULL,
        object_size BIGINT NOT NULL,
        file_type VARCHAR(12) NOT NULL,
        allocation_id BIGINT,
        loader_instance_id BIGINT REFERENCES loader_instances (loader_instance_id),
        load_started TIMESTAMPTZ,
        load_completed TIMESTAMPTZ,
        CONSTRAINT unq_resource_bundle_bktnm UNIQUE (bucket_path_id, object_name)
    );

    CREATE INDEX IF NOT EXISTS idx_resource_bundle_allocid
        ON resource_bundles (allocation_id);

    CREATE TABLE IF NOT EXISTS resource_types (
        resource_type_id INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        resource_type VARCHAR(64) NOT NULL,
        CONSTRAINT unq_resource_types_rt UNIQUE (resource_type)
    );

    CREATE TABLE IF NOT EXISTS logical_resources (
        logical_resource_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        resource_type_id INTEGER NOT NULL REFERENCES resource_types (resource_type_id),
        logical_id VARCHAR(255) NOT NULL,
        resource_bundle_id BIGINT NOT NULL REFERENCES resource_bundles (resource_bundle_id),
        CONSTRAINT unq_logical_resources UNIQUE (resource_type_id, logical_id)
    );
"#;
