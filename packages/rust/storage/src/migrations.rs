//! SQL migration definitions for the pipeline database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.
//!
//! Immutability of evidence, claims and published grounding is enforced by
//! triggers so that no code path can bypass it.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: discovery surface, evidence, claims, rules, conflicts, backfill runs, graph",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Shared discovery surface for both producers
CREATE TABLE IF NOT EXISTS discovered_items (
    id               TEXT PRIMARY KEY,
    source_id        TEXT NOT NULL,
    url              TEXT NOT NULL,
    canonical_url    TEXT NOT NULL,
    status           TEXT NOT NULL,
    state_json       TEXT NOT NULL,
    method           TEXT NOT NULL,
    content_hash     TEXT,
    evidence_id      TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    crawl_depth      INTEGER NOT NULL DEFAULT 0,
    change_frequency TEXT NOT NULL,
    freshness_risk   TEXT NOT NULL,
    backfill_run_id  TEXT,
    discovered_at    TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE(source_id, canonical_url)
);

CREATE INDEX IF NOT EXISTS idx_items_status ON discovered_items(status, discovered_at);
CREATE INDEX IF NOT EXISTS idx_items_evidence ON discovered_items(evidence_id);

-- Immutable captures, versioned by content
CREATE TABLE IF NOT EXISTS evidence (
    id               TEXT PRIMARY KEY,
    source_id        TEXT NOT NULL,
    url              TEXT NOT NULL,
    content_hash     TEXT NOT NULL,
    raw_content      BLOB NOT NULL,
    content_type     TEXT,
    content_class    TEXT NOT NULL,
    fetched_at       TEXT NOT NULL,
    last_verified_at TEXT NOT NULL,
    staleness        TEXT NOT NULL DEFAULT 'FRESH',
    ocr_text         TEXT,
    UNIQUE(url, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_evidence_url ON evidence(url, fetched_at);

CREATE TRIGGER IF NOT EXISTS evidence_core_immutable
BEFORE UPDATE OF source_id, url, content_hash, raw_content, fetched_at, content_class ON evidence
BEGIN
    SELECT RAISE(ABORT, 'evidence core fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS evidence_no_delete
BEFORE DELETE ON evidence
BEGIN
    SELECT RAISE(ABORT, 'evidence is append-only');
END;

-- Grounded extractions (append-only)
CREATE TABLE IF NOT EXISTS atomic_claims (
    id               TEXT PRIMARY KEY,
    evidence_id      TEXT NOT NULL REFERENCES evidence(id),
    concept          TEXT NOT NULL,
    exact_quote      TEXT NOT NULL,
    normalized_value TEXT NOT NULL,
    value_type       TEXT NOT NULL,
    confidence       REAL NOT NULL,
    legal_reference  TEXT,
    effective_from   TEXT,
    authority        TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    UNIQUE(evidence_id, concept, exact_quote, normalized_value)
);

CREATE INDEX IF NOT EXISTS idx_claims_concept ON atomic_claims(concept);

CREATE TRIGGER IF NOT EXISTS claims_no_update
BEFORE UPDATE ON atomic_claims
BEGIN
    SELECT RAISE(ABORT, 'claims are append-only');
END;

CREATE TRIGGER IF NOT EXISTS claims_no_delete
BEFORE DELETE ON atomic_claims
BEGIN
    SELECT RAISE(ABORT, 'claims are append-only');
END;

-- Composed rules
CREATE TABLE IF NOT EXISTS rules (
    id             TEXT PRIMARY KEY,
    concept        TEXT NOT NULL,
    value          TEXT NOT NULL,
    value_type     TEXT NOT NULL,
    status         TEXT NOT NULL,
    authority      TEXT NOT NULL,
    authority_rank INTEGER NOT NULL,
    confidence     REAL NOT NULL,
    effective_from TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_concept ON rules(concept, effective_from);
CREATE INDEX IF NOT EXISTS idx_rules_status ON rules(status);

CREATE TRIGGER IF NOT EXISTS rules_published_assertion_immutable
BEFORE UPDATE OF concept, value, value_type, effective_from, authority, confidence ON rules
WHEN OLD.status = 'PUBLISHED'
BEGIN
    SELECT RAISE(ABORT, 'published rule assertion is immutable');
END;

CREATE TABLE IF NOT EXISTS rule_sources (
    rule_id     TEXT NOT NULL REFERENCES rules(id),
    claim_id    TEXT NOT NULL REFERENCES atomic_claims(id),
    evidence_id TEXT NOT NULL,
    url         TEXT NOT NULL,
    exact_quote TEXT NOT NULL,
    PRIMARY KEY (rule_id, claim_id)
);

CREATE TRIGGER IF NOT EXISTS rule_sources_frozen_on_publish
BEFORE INSERT ON rule_sources
WHEN (SELECT status FROM rules WHERE id = NEW.rule_id) = 'PUBLISHED'
BEGIN
    SELECT RAISE(ABORT, 'published rule grounding is immutable');
END;

CREATE TRIGGER IF NOT EXISTS rule_sources_no_delete
BEFORE DELETE ON rule_sources
BEGIN
    SELECT RAISE(ABORT, 'rule grounding is append-only');
END;

CREATE TABLE IF NOT EXISTS rule_transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id     TEXT NOT NULL REFERENCES rules(id),
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    actor       TEXT NOT NULL,
    reason      TEXT,
    at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_rule ON rule_transitions(rule_id);

-- Conflicts between rule candidates
CREATE TABLE IF NOT EXISTS conflicts (
    id              TEXT PRIMARY KEY,
    concept         TEXT NOT NULL,
    effective_from  TEXT,
    status          TEXT NOT NULL,
    resolution_json TEXT,
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status);

CREATE TABLE IF NOT EXISTS conflict_rules (
    conflict_id TEXT NOT NULL REFERENCES conflicts(id),
    rule_id     TEXT NOT NULL REFERENCES rules(id),
    PRIMARY KEY (conflict_id, rule_id)
);

CREATE INDEX IF NOT EXISTS idx_conflict_rules_rule ON conflict_rules(rule_id);

-- Knowledge graph (published rules only)
CREATE TABLE IF NOT EXISTS graph_edges (
    from_rule  TEXT NOT NULL REFERENCES rules(id),
    to_rule    TEXT NOT NULL REFERENCES rules(id),
    kind       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_rule, to_rule, kind)
);

-- Operator-triggered historical crawls
CREATE TABLE IF NOT EXISTS backfill_runs (
    id              TEXT PRIMARY KEY,
    params_json     TEXT NOT NULL,
    status          TEXT NOT NULL,
    discovered_count INTEGER NOT NULL DEFAULT 0,
    queued_count    INTEGER NOT NULL DEFAULT 0,
    skipped_count   INTEGER NOT NULL DEFAULT 0,
    error_count     INTEGER NOT NULL DEFAULT 0,
    errors_json     TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL,
    finished_at     TEXT
);

-- Scheduled cadence bookkeeping
CREATE TABLE IF NOT EXISTS source_cursors (
    source_id         TEXT PRIMARY KEY,
    last_scheduled_at TEXT NOT NULL,
    last_discovered   INTEGER NOT NULL DEFAULT 0
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Durable queues, dead letters, rejections, audit trail, release outbox",
            sql: r#"
CREATE TABLE IF NOT EXISTS jobs (
    queue        TEXT NOT NULL,
    id           TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    state        TEXT NOT NULL,
    priority     INTEGER NOT NULL DEFAULT 0,
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    run_at       TEXT NOT NULL,
    last_error   TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    finished_at  TEXT,
    PRIMARY KEY (queue, id)
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, priority DESC, run_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    queue        TEXT NOT NULL,
    id           TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    attempts     INTEGER NOT NULL,
    error        TEXT NOT NULL,
    failed_at    TEXT NOT NULL,
    PRIMARY KEY (queue, id)
);

CREATE TABLE IF NOT EXISTS rejections (
    id         TEXT PRIMARY KEY,
    stage      TEXT NOT NULL,
    entity_id  TEXT NOT NULL,
    reason     TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    at          TEXT NOT NULL,
    stage       TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    action      TEXT NOT NULL,
    detail_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_kind, entity_id);

CREATE TABLE IF NOT EXISTS release_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id      TEXT NOT NULL REFERENCES rules(id),
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
