use postgres::Client;

use super::StoreError;

const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    signature_html TEXT,
    profile_completed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS campaigns (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    pitch TEXT,
    tone TEXT,
    status TEXT NOT NULL DEFAULT 'draft',
    start_time TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS campaign_tags (
    campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (campaign_id, tag)
);

CREATE TABLE IF NOT EXISTS leads (
    id UUID PRIMARY KEY,
    campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    email TEXT NOT NULL,
    first_name TEXT,
    company TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (campaign_id, email)
);

CREATE TABLE IF NOT EXISTS templates (
    id UUID PRIMARY KEY,
    campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    step_number INTEGER NOT NULL CHECK (step_number >= 1),
    subject TEXT NOT NULL,
    body_html TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (campaign_id, step_number)
);

CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    lead_id UUID NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
    step_number INTEGER NOT NULL CHECK (step_number >= 1),
    status TEXT NOT NULL DEFAULT 'pending',
    scheduled_at TIMESTAMPTZ NOT NULL,
    sent_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    message_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS jobs_due_idx ON jobs(status, scheduled_at);
CREATE INDEX IF NOT EXISTS jobs_sent_at_idx ON jobs(sent_at);
CREATE INDEX IF NOT EXISTS jobs_campaign_idx ON jobs(campaign_id);
CREATE INDEX IF NOT EXISTS jobs_lead_idx ON jobs(lead_id);
CREATE INDEX IF NOT EXISTS jobs_message_id_idx ON jobs(message_id);
CREATE UNIQUE INDEX IF NOT EXISTS jobs_lead_step_live_idx
    ON jobs(lead_id, step_number) WHERE status <> 'failed';
"#;

pub(super) fn ensure_schema(client: &mut Client) -> Result<(), StoreError> {
    client.batch_execute(CORE_SCHEMA)?;
    ensure_template_columns(client)?;
    ensure_user_columns(client)?;
    Ok(())
}

fn ensure_template_columns(client: &mut Client) -> Result<(), StoreError> {
    client.batch_execute(
        "ALTER TABLE templates
             ADD COLUMN IF NOT EXISTS delay_minutes BIGINT NOT NULL DEFAULT 0",
    )?;
    Ok(())
}

fn ensure_user_columns(client: &mut Client) -> Result<(), StoreError> {
    client.batch_execute(
        "ALTER TABLE users
             ADD COLUMN IF NOT EXISTS signature_html TEXT;
         ALTER TABLE users
             ADD COLUMN IF NOT EXISTS profile_completed BOOLEAN NOT NULL DEFAULT FALSE",
    )?;
    Ok(())
}
