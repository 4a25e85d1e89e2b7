//! Installation of the audit trigger that publishes row changes as
//! notifications.
//!
//! The trigger fires on inserts and updates of the audit table, enriches the
//! serialized row according to its `action` column and publishes the result
//! with `pg_notify`. Actions without a handler are stored without publishing
//! anything.

use log::info;
use sqlx::postgres::PgPool;

/// Channel the audit trigger publishes to unless configured otherwise.
pub const DEFAULT_EVENTS_CHANNEL: &str = "audit-events";

/// `pg_notify` rejects payloads near 8000 bytes, so anything larger is
/// replaced by a placeholder and flagged before publishing.
const TRUNCATION_PLACEHOLDER: &str = "Payload too large. Truncated.";

/// Creates or replaces the notify function and (re)installs the trigger on
/// `table`, publishing to `channel`. Idempotent.
pub async fn install_audit_trigger(
    pool: &PgPool,
    table: &str,
    channel: &str,
) -> Result<(), sqlx::Error> {
    let create_function = format!(
        r#"
        CREATE OR REPLACE FUNCTION ripple_notify_audit_event() RETURNS trigger AS
        $$
        DECLARE
            channel text := TG_ARGV[0];
            js jsonb;
            result_data jsonb;
        BEGIN
            SELECT to_jsonb(NEW.*) INTO js;
            js := jsonb_set(js, '{{dml_action}}', to_jsonb(TG_OP));

            CASE NEW.action
                WHEN 'entity.update.version' THEN
                    SELECT entity_defs.data
                    INTO result_data
                    FROM entity_defs
                    WHERE entity_defs.id = (NEW.details->>'entityDefId')::int;

                    js := jsonb_set(js, '{{data}}', result_data, true);

                WHEN 'submission.create' THEN
                    SELECT jsonb_build_object('xml', submission_defs.xml)
                    INTO result_data
                    FROM submission_defs
                    WHERE submission_defs.id = (NEW.details->>'submissionDefId')::int;

                    js := jsonb_set(js, '{{data}}', result_data, true);

                WHEN 'submission.update' THEN
                    SELECT jsonb_build_object('instanceId', submission_defs."instanceId")
                    INTO result_data
                    FROM submission_defs
                    WHERE submission_defs.id = (NEW.details->>'submissionDefId')::int;

                    js := jsonb_set(js, '{{details}}', (js->'details') || result_data, true);
                    js := jsonb_set(js, '{{data}}', NEW.details, true);

                ELSE
                    -- Unsupported action: store the row, publish nothing.
                    RETURN NEW;
            END CASE;

            IF octet_length(js::text) > 8000 THEN
                js := jsonb_set(js, '{{truncated}}', 'true'::jsonb, true);
                js := jsonb_set(js, '{{data}}', '"{placeholder}"'::jsonb, true);
            END IF;

            PERFORM pg_notify(channel, js::text);
            RETURN NEW;
        END;
        $$ LANGUAGE 'plpgsql';
        "#,
        placeholder = TRUNCATION_PLACEHOLDER,
    );
    sqlx::query(&create_function).execute(pool).await?;

    let drop_trigger = format!(
        r#"
        DROP TRIGGER IF EXISTS ripple_audit_event_trigger ON {table};
        "#
    );
    sqlx::query(&drop_trigger).execute(pool).await?;

    // Single quotes in the channel name are escaped to keep the trigger
    // argument well-formed.
    let create_trigger = format!(
        r#"
        CREATE TRIGGER ripple_audit_event_trigger
            BEFORE INSERT OR UPDATE ON {table}
            FOR EACH ROW
                EXECUTE FUNCTION ripple_notify_audit_event('{channel}');
        "#,
        channel = channel.replace('\'', "''"),
    );
    sqlx::query(&create_trigger).execute(pool).await?;

    info!("audit trigger installed on table '{table}', publishing to '{channel}'");
    Ok(())
}
