pub const DDL: &str = "
CREATE TABLE IF NOT EXISTS task (
    id   TEXT NOT NULL,
    name TEXT,
    meta TEXT,
    time INTEGER,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS result (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL,
    key         TEXT NOT NULL,
    sql         TEXT,
    version     TEXT,
    data_digest TEXT,
    result      BLOB,
    time        INTEGER,
    duration    REAL
);

CREATE TABLE IF NOT EXISTS key_state (
    task_id TEXT NOT NULL,
    key     TEXT NOT NULL,
    state   TEXT NOT NULL,
    PRIMARY KEY (task_id, key)
);

CREATE INDEX IF NOT EXISTS idx_result_task_id_key ON result(task_id, key);
";
