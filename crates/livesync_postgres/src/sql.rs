//! SQL text for the bookkeeping schema.
//!
//! Schema and channel prefix are interpolated, so both are restricted to
//! plain lowercase identifiers. Everything else is bound as a parameter or
//! quoted inside plpgsql with `format('%I')`.

use crate::error::{PgError, PgResult};
use livesync_protocol::{DATA_KIND, DELIMITER, SCHEMA_KIND};

/// DDL command tags reported by the schema watch.
pub const SCHEMA_WATCH_TAGS: &[&str] = &[
    "CREATE TABLE",
    "ALTER TABLE",
    "DROP TABLE",
    "CREATE VIEW",
    "DROP VIEW",
    "ALTER VIEW",
    "CREATE TABLE AS",
    "SELECT INTO",
];

const MAX_IDENTIFIER_LEN: usize = 63;

/// Checks that `name` can be interpolated into SQL unquoted.
pub fn validate_identifier(name: &str) -> PgResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(PgError::InvalidIdentifier(name.to_string()))
    }
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Generates every statement the backend runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCatalog {
    schema: String,
    notify_prefix: String,
}

impl SqlCatalog {
    /// Creates a catalog for `schema`, with app channels named
    /// `<notify_prefix><app_id>`.
    pub fn new(schema: impl Into<String>, notify_prefix: impl Into<String>) -> PgResult<Self> {
        let schema = schema.into();
        let notify_prefix = notify_prefix.into();
        validate_identifier(&schema)?;
        validate_identifier(&notify_prefix)?;
        Ok(Self {
            schema,
            notify_prefix,
        })
    }

    /// Bookkeeping schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Notification channel of an app.
    pub fn channel(&self, app_id: &str) -> String {
        format!("{}{}", self.notify_prefix, app_id)
    }

    /// Prefix of the per-table data triggers.
    pub fn trigger_prefix(&self) -> String {
        format!("{}_watch_", self.schema)
    }

    /// Name of the schema watch event trigger.
    pub fn event_trigger_name(&self) -> String {
        format!("{}_schema_watch", self.schema)
    }

    /// Creates or upgrades the schema, its tables and functions.
    /// Safe to run repeatedly.
    pub fn install(&self) -> String {
        let s = &self.schema;
        let prefix = literal(&self.notify_prefix);
        let delimiter = literal(DELIMITER);
        let data_kind = literal(DATA_KIND);
        let schema_kind = literal(SCHEMA_KIND);
        let trigger_prefix = literal(&self.trigger_prefix());

        format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {s};

CREATE TABLE IF NOT EXISTS {s}.apps (
    id                 TEXT PRIMARY KEY,
    added              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    application_name   TEXT,
    last_check         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_check_ended   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    watching_schema    BOOLEAN NOT NULL DEFAULT FALSE,
    check_frequency_ms INTEGER NOT NULL
);
COMMENT ON TABLE {s}.apps IS 'Server processes sharing this database';

CREATE TABLE IF NOT EXISTS {s}.app_triggers (
    app_id     TEXT NOT NULL,
    table_name TEXT NOT NULL,
    condition  TEXT NOT NULL,
    inserted   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_used  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (app_id, table_name, condition)
);
COMMENT ON TABLE {s}.app_triggers IS 'Tables and conditions each app listens to';

CREATE OR REPLACE VIEW {s}.v_triggers AS
SELECT t.*,
    (ROW_NUMBER() OVER (ORDER BY app_id, table_name, condition COLLATE "C"))::text AS id,
    ROW_NUMBER() OVER (
        PARTITION BY app_id, table_name
        ORDER BY condition COLLATE "C"
    ) - 1 AS c_id
FROM {s}.app_triggers t;

CREATE OR REPLACE FUNCTION {s}.data_watch() RETURNS TRIGGER AS $fn$
DECLARE
    unions     TEXT;
    t_ids      TEXT[];
    failed     BOOLEAN := FALSE;
    err_text   TEXT;
    err_detail TEXT;
    err_hint   TEXT;
    arw        RECORD;
BEGIN
    SELECT string_agg(
        concat_ws(
            ' UNION ALL ',
            CASE WHEN TG_OP IN ('DELETE', 'UPDATE') THEN format(
                'SELECT CASE WHEN EXISTS (SELECT 1 FROM old_table AS %I WHERE %s) THEN %L END AS t_id',
                table_name, condition, id
            ) END,
            CASE WHEN TG_OP IN ('INSERT', 'UPDATE') THEN format(
                'SELECT CASE WHEN EXISTS (SELECT 1 FROM new_table AS %I WHERE %s) THEN %L END AS t_id',
                table_name, condition, id
            ) END
        ),
        ' UNION ALL '
    )
    INTO unions
    FROM {s}.v_triggers
    WHERE table_name = TG_TABLE_NAME;

    IF unions IS NULL THEN
        RETURN NULL;
    END IF;

    BEGIN
        EXECUTE format(
            'SELECT array_agg(DISTINCT t.t_id) FROM (%s) t WHERE t.t_id IS NOT NULL',
            unions
        ) INTO t_ids;
    EXCEPTION WHEN OTHERS THEN
        failed := TRUE;
        GET STACKED DIAGNOSTICS
            err_text = MESSAGE_TEXT,
            err_detail = PG_EXCEPTION_DETAIL,
            err_hint = PG_EXCEPTION_HINT;
    END;

    IF t_ids IS NULL AND NOT failed THEN
        RETURN NULL;
    END IF;

    FOR arw IN
        SELECT app_id, string_agg(c_id::text, ',' ORDER BY c_id) AS c_ids
        FROM {s}.v_triggers
        WHERE table_name = TG_TABLE_NAME
          AND (failed OR id = ANY(t_ids))
        GROUP BY app_id
    LOOP
        PERFORM pg_notify(
            {prefix} || arw.app_id,
            concat_ws(
                {delimiter},
                {data_kind},
                TG_TABLE_NAME,
                TG_OP,
                CASE WHEN failed
                    THEN concat_ws('; ', 'error', err_text, err_detail, err_hint)
                    ELSE arw.c_ids
                END
            )
        );
    END LOOP;

    RETURN NULL;
END;
$fn$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION {s}.sync_table_triggers() RETURNS TRIGGER AS $fn$
DECLARE
    trw RECORD;
    op  TEXT;
BEGIN
    IF TG_OP = 'DELETE' THEN
        FOR trw IN
            SELECT DISTINCT ot.table_name
            FROM old_table ot
            WHERE NOT EXISTS (
                SELECT 1 FROM {s}.app_triggers t WHERE t.table_name = ot.table_name
            )
            AND to_regclass(format('public.%I', ot.table_name)) IS NOT NULL
        LOOP
            FOREACH op IN ARRAY ARRAY['insert', 'update', 'delete'] LOOP
                EXECUTE format(
                    'DROP TRIGGER IF EXISTS %I ON public.%I',
                    {trigger_prefix} || trw.table_name || '_' || op,
                    trw.table_name
                );
            END LOOP;
        END LOOP;
    ELSIF TG_OP = 'INSERT' THEN
        FOR trw IN
            SELECT DISTINCT nt.table_name
            FROM new_table nt
            WHERE to_regclass(format('public.%I', nt.table_name)) IS NOT NULL
        LOOP
            EXECUTE format(
                'DROP TRIGGER IF EXISTS %1$I ON public.%2$I;
                 CREATE TRIGGER %1$I AFTER INSERT ON public.%2$I
                 REFERENCING NEW TABLE AS new_table
                 FOR EACH STATEMENT EXECUTE FUNCTION {s}.data_watch();',
                {trigger_prefix} || trw.table_name || '_insert',
                trw.table_name
            );
            EXECUTE format(
                'DROP TRIGGER IF EXISTS %1$I ON public.%2$I;
                 CREATE TRIGGER %1$I AFTER UPDATE ON public.%2$I
                 REFERENCING OLD TABLE AS old_table NEW TABLE AS new_table
                 FOR EACH STATEMENT EXECUTE FUNCTION {s}.data_watch();',
                {trigger_prefix} || trw.table_name || '_update',
                trw.table_name
            );
            EXECUTE format(
                'DROP TRIGGER IF EXISTS %1$I ON public.%2$I;
                 CREATE TRIGGER %1$I AFTER DELETE ON public.%2$I
                 REFERENCING OLD TABLE AS old_table
                 FOR EACH STATEMENT EXECUTE FUNCTION {s}.data_watch();',
                {trigger_prefix} || trw.table_name || '_delete',
                trw.table_name
            );
        END LOOP;
    END IF;

    RETURN NULL;
END;
$fn$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS app_triggers_insert ON {s}.app_triggers;
CREATE TRIGGER app_triggers_insert
AFTER INSERT ON {s}.app_triggers
REFERENCING NEW TABLE AS new_table
FOR EACH STATEMENT EXECUTE FUNCTION {s}.sync_table_triggers();

DROP TRIGGER IF EXISTS app_triggers_delete ON {s}.app_triggers;
CREATE TRIGGER app_triggers_delete
AFTER DELETE ON {s}.app_triggers
REFERENCING OLD TABLE AS old_table
FOR EACH STATEMENT EXECUTE FUNCTION {s}.sync_table_triggers();

CREATE OR REPLACE FUNCTION {s}.schema_watch() RETURNS event_trigger AS $fn$
DECLARE
    arw        RECORD;
    curr_query TEXT := LEFT(COALESCE(current_query(), ''), 5000);
BEGIN
    FOR arw IN SELECT id FROM {s}.apps WHERE watching_schema LOOP
        PERFORM pg_notify(
            {prefix} || arw.id,
            concat_ws({delimiter}, {schema_kind}, tg_tag, tg_event, curr_query)
        );
    END LOOP;
END;
$fn$ LANGUAGE plpgsql;
"#
        )
    }

    /// Removes the schema, its triggers on user tables and the event trigger.
    pub fn uninstall(&self) -> String {
        format!(
            "DROP EVENT TRIGGER IF EXISTS {};\nDROP SCHEMA IF EXISTS {} CASCADE;\n",
            self.event_trigger_name(),
            self.schema
        )
    }

    /// Checks that the bookkeeping tables exist. Takes no parameters and
    /// returns one boolean.
    pub fn is_installed(&self) -> String {
        format!(
            "SELECT to_regclass({}) IS NOT NULL AS installed",
            literal(&format!("{}.app_triggers", self.schema))
        )
    }

    /// Forgets apps that stopped heartbeating and their triggers, then
    /// creates or drops the schema watch event trigger. Event triggers need
    /// a superuser; for other roles that part is skipped.
    pub fn prepare(&self) -> String {
        let s = &self.schema;
        let event_trigger = self.event_trigger_name();
        let event_trigger_lit = literal(&event_trigger);
        let tags = SCHEMA_WATCH_TAGS
            .iter()
            .map(|t| literal(t))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"
DO $do$
DECLARE
    is_super BOOLEAN := EXISTS (
        SELECT 1 FROM pg_roles WHERE rolname = current_user AND rolsuper
    );
    needed   BOOLEAN;
    present  BOOLEAN;
BEGIN
    LOCK TABLE {s}.app_triggers IN ACCESS EXCLUSIVE MODE;

    DELETE FROM {s}.apps
    WHERE last_check < NOW() - 8 * check_frequency_ms * interval '1 millisecond';

    DELETE FROM {s}.app_triggers
    WHERE app_id NOT IN (SELECT id FROM {s}.apps);

    needed := EXISTS (SELECT 1 FROM {s}.apps WHERE watching_schema);
    present := EXISTS (SELECT 1 FROM pg_event_trigger WHERE evtname = {event_trigger_lit});

    IF is_super AND NOT needed AND present THEN
        DROP EVENT TRIGGER IF EXISTS {event_trigger};
    ELSIF is_super AND needed AND NOT present THEN
        CREATE EVENT TRIGGER {event_trigger} ON ddl_command_end
        WHEN TAG IN ({tags})
        EXECUTE FUNCTION {s}.schema_watch();
    END IF;
END
$do$;
"#
        )
    }

    /// Registers or refreshes an app.
    /// Binds: `$1` app id, `$2` heartbeat ms, `$3` watching schema.
    pub fn register_app(&self) -> String {
        format!(
            "INSERT INTO {}.apps (id, check_frequency_ms, watching_schema, application_name) \
             VALUES ($1, $2, $3, current_setting('application_name')) \
             ON CONFLICT (id) DO UPDATE \
             SET last_check = NOW(), \
                 check_frequency_ms = EXCLUDED.check_frequency_ms, \
                 watching_schema = EXCLUDED.watching_schema",
            self.schema
        )
    }

    /// Removes an app. Binds: `$1` app id.
    pub fn unregister_app(&self) -> String {
        format!("DELETE FROM {}.apps WHERE id = $1", self.schema)
    }

    /// Marks an app alive. Binds: `$1` app id.
    pub fn heartbeat(&self) -> String {
        format!(
            "UPDATE {}.apps SET last_check = NOW() WHERE id = $1",
            self.schema
        )
    }

    /// Marks the end of a heartbeat. Binds: `$1` app id.
    pub fn heartbeat_ended(&self) -> String {
        format!(
            "UPDATE {}.apps SET last_check_ended = NOW() WHERE id = $1",
            self.schema
        )
    }

    /// Refreshes `last_used` of triggers still listened to.
    /// Binds: `$1` app id, `$2` table names, `$3` conditions.
    pub fn touch_triggers(&self) -> String {
        format!(
            "UPDATE {}.app_triggers SET last_used = NOW() \
             WHERE app_id = $1 \
             AND (table_name, condition) IN (SELECT * FROM UNNEST($2::text[], $3::text[]))",
            self.schema
        )
    }

    /// Removes an app's triggers that were not used recently.
    /// Binds: `$1` app id, `$2` maximum idle time in ms.
    pub fn delete_stale_triggers(&self) -> String {
        format!(
            "DELETE FROM {}.app_triggers \
             WHERE app_id = $1 \
             AND last_used < NOW() - $2::bigint * interval '1 millisecond'",
            self.schema
        )
    }

    /// Serializes trigger changes across apps.
    pub fn lock_triggers(&self) -> String {
        format!(
            "LOCK TABLE {}.app_triggers IN ACCESS EXCLUSIVE MODE",
            self.schema
        )
    }

    /// Records a trigger. Binds: `$1` app id, `$2` table, `$3` condition.
    pub fn add_trigger(&self) -> String {
        format!(
            "INSERT INTO {}.app_triggers (app_id, table_name, condition) VALUES ($1, $2, $3) \
             ON CONFLICT (app_id, table_name, condition) DO UPDATE SET last_used = NOW()",
            self.schema
        )
    }

    /// Removes a trigger. Binds: `$1` app id, `$2` table, `$3` condition.
    pub fn remove_trigger(&self) -> String {
        format!(
            "DELETE FROM {}.app_triggers WHERE app_id = $1 AND table_name = $2 AND condition = $3",
            self.schema
        )
    }

    /// Removes every trigger of an app. Binds: `$1` app id.
    pub fn clear_triggers(&self) -> String {
        format!("DELETE FROM {}.app_triggers WHERE app_id = $1", self.schema)
    }

    /// Lists triggers, optionally of one app. Binds: `$1` app id or null.
    pub fn list_triggers(&self) -> String {
        format!(
            "SELECT app_id, table_name, condition, \
             EXTRACT(EPOCH FROM NOW() - last_used)::float8 AS idle_secs \
             FROM {}.app_triggers \
             WHERE $1::text IS NULL OR app_id = $1 \
             ORDER BY app_id, table_name, condition COLLATE \"C\"",
            self.schema
        )
    }

    /// Checks that a condition is valid on a table without reading rows.
    pub fn probe_condition(table: &str, condition: &str) -> String {
        format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 0",
            livesync_protocol::quote_ident(table),
            condition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SqlCatalog {
        SqlCatalog::new("livesync", "livesync_").unwrap()
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("livesync").is_ok());
        assert!(validate_identifier("_ls2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2ls").is_err());
        assert!(validate_identifier("LiveSync").is_err());
        assert!(validate_identifier("ls; drop").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(SqlCatalog::new("ok", "bad-prefix").is_err());
    }

    #[test]
    fn install_uses_protocol_constants() {
        let sql = catalog().install();
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS livesync;"));
        assert!(sql.contains(&format!("'{DELIMITER}'")));
        assert!(sql.contains("'data_has_changed'"));
        assert!(sql.contains("'schema_has_changed'"));
        assert!(sql.contains("'livesync_' || arw.app_id"));
        assert!(sql.contains("'livesync_watch_' || trw.table_name || '_insert'"));
        assert!(sql.contains("REFERENCING OLD TABLE AS old_table NEW TABLE AS new_table"));
        // Condition positions follow byte order, like the engine's list.
        assert!(sql.contains("ORDER BY condition COLLATE \"C\""));
    }

    #[test]
    fn install_escapes_literals() {
        assert_eq!(literal("it's"), "'it''s'");
    }

    #[test]
    fn prepare_manages_event_trigger() {
        let sql = catalog().prepare();
        assert!(sql.contains("CREATE EVENT TRIGGER livesync_schema_watch ON ddl_command_end"));
        assert!(sql.contains("'CREATE TABLE AS'"));
        assert!(sql.contains("8 * check_frequency_ms"));
        assert!(sql.contains("LOCK TABLE livesync.app_triggers IN ACCESS EXCLUSIVE MODE"));
    }

    #[test]
    fn statements_target_the_schema() {
        let c = SqlCatalog::new("ls_test", "ls_").unwrap();
        assert_eq!(c.channel("abc"), "ls_abc");
        assert!(c.add_trigger().starts_with("INSERT INTO ls_test.app_triggers"));
        assert!(c.remove_trigger().starts_with("DELETE FROM ls_test.app_triggers"));
        assert!(c.touch_triggers().contains("UNNEST($2::text[], $3::text[])"));
        assert!(c.is_installed().contains("'ls_test.app_triggers'"));
        assert_eq!(
            c.uninstall(),
            "DROP EVENT TRIGGER IF EXISTS ls_test_schema_watch;\nDROP SCHEMA IF EXISTS ls_test CASCADE;\n"
        );
    }

    #[test]
    fn probe_quotes_the_table() {
        assert_eq!(
            SqlCatalog::probe_condition("Items", "\"kind\" = 'a'"),
            "SELECT 1 FROM \"Items\" WHERE \"kind\" = 'a' LIMIT 0"
        );
    }
}
