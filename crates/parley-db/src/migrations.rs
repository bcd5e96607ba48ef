use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            email         TEXT NOT NULL UNIQUE,
            password      TEXT NOT NULL,
            display_name  TEXT NOT NULL,
            avatar_url    TEXT,
            role          TEXT NOT NULL DEFAULT 'user'
                          CHECK (role IN ('admin', 'user', 'bot')),
            is_online     INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL
        );

        -- At most one synthetic assistant identity
        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_single_bot
            ON users(role) WHERE role = 'bot';

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token_hash  TEXT NOT NULL UNIQUE,
            expires_at  TEXT NOT NULL,
            revoked_at  TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            refresh_token_id  TEXT NOT NULL UNIQUE
                              REFERENCES refresh_tokens(id) ON DELETE CASCADE,
            ip_address        TEXT,
            user_agent        TEXT,
            last_activity_at  TEXT NOT NULL,
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);

        CREATE TABLE IF NOT EXISTS conversations (
            id               TEXT PRIMARY KEY,
            kind             TEXT NOT NULL CHECK (kind IN ('private', 'group')),
            title            TEXT,
            owner_id         TEXT REFERENCES users(id),
            -- sorted 'lo:hi' user pair, private conversations only
            pair_key         TEXT UNIQUE,
            is_bot_active    INTEGER NOT NULL DEFAULT 0,
            last_message_id  TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK ((kind = 'private') = (pair_key IS NOT NULL))
        );

        CREATE TRIGGER IF NOT EXISTS trg_conversations_kind_immutable
            BEFORE UPDATE OF kind ON conversations
            WHEN NEW.kind <> OLD.kind
        BEGIN
            SELECT RAISE(ABORT, 'conversation kind is immutable');
        END;

        CREATE TABLE IF NOT EXISTS conversation_members (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id          TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role             TEXT NOT NULL DEFAULT 'member'
                             CHECK (role IN ('member', 'admin')),
            joined_at        TEXT NOT NULL,
            last_read_at     TEXT,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_members_user
            ON conversation_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id        TEXT NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            kind             TEXT NOT NULL DEFAULT 'text'
                             CHECK (kind IN ('text', 'image', 'audio', 'system', 'ai')),
            is_recalled      INTEGER NOT NULL DEFAULT 0,
            metadata         TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- Recall is one-way
        CREATE TRIGGER IF NOT EXISTS trg_messages_recall_one_way
            BEFORE UPDATE OF is_recalled ON messages
            WHEN OLD.is_recalled = 1 AND NEW.is_recalled = 0
        BEGIN
            SELECT RAISE(ABORT, 'recall cannot be undone');
        END;

        -- Per-user soft deletion (the message's deleted_for set)
        CREATE TABLE IF NOT EXISTS message_deletions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            deleted_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
