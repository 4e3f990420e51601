use crate::Database;
use crate::models::{MessageRow, ReadPositionRow, format_timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use murmur_types::{Author, ChannelId, MessageId, Order, UserId};
use rusqlite::Connection;

const MESSAGE_COLUMNS: &str = "m.channel_id, m.id, m.user_id, u.name, u.display_name, u.avatar_icon, m.content, m.created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str, display_name: &str, avatar_icon: &str) -> Result<UserId> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (name, display_name, avatar_icon) VALUES (?1, ?2, ?3)",
                (name, display_name, avatar_icon),
            )?;
            Ok(UserId(conn.last_insert_rowid()))
        })
    }

    pub fn get_author(&self, user_id: UserId) -> Result<Option<Author>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, display_name, avatar_icon FROM users WHERE id = ?1",
                [user_id.get()],
                |row| {
                    Ok(Author {
                        id: UserId(row.get(0)?),
                        name: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_icon: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Change a user's display fields. Returns `false` for an unknown user.
    pub fn update_profile(&self, user_id: UserId, display_name: &str, avatar_icon: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET display_name = ?2, avatar_icon = ?3 WHERE id = ?1",
                rusqlite::params![user_id.get(), display_name, avatar_icon],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Channels --

    pub fn create_channel(&self, name: &str, description: &str) -> Result<ChannelId> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO channels (name, description) VALUES (?1, ?2)",
                (name, description),
            )?;
            Ok(ChannelId(conn.last_insert_rowid()))
        })
    }

    pub fn list_channel_ids(&self) -> Result<Vec<ChannelId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM channels ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0).map(ChannelId))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Messages --

    /// Insert a message under an id allocated by the caller.
    /// Returns `false` when the id is already taken in that channel.
    pub fn insert_message(
        &self,
        channel_id: ChannelId,
        id: MessageId,
        user_id: UserId,
        content: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let res = conn.execute(
                "INSERT INTO messages (channel_id, id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    channel_id.get(),
                    id.get(),
                    user_id.get(),
                    content,
                    format_timestamp(created_at)
                ],
            );
            match res {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Insert a message and let the database pick the next id in the channel.
    /// Used when the cache-side allocator is unreachable; the writer lock
    /// serializes concurrent callers.
    pub fn insert_message_next(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        content: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<MessageId> {
        self.with_conn_mut(|conn| {
            let id: i64 = conn.query_row(
                "INSERT INTO messages (channel_id, id, user_id, content, created_at)
                 SELECT ?1, COALESCE(MAX(id), 0) + 1, ?2, ?3, ?4 FROM messages WHERE channel_id = ?1
                 RETURNING id",
                rusqlite::params![channel_id.get(), user_id.get(), content, format_timestamp(created_at)],
                |row| row.get(0),
            )?;
            Ok(MessageId(id))
        })
    }

    /// Messages with id greater than `after`, paginated. `limit = None` means unbounded.
    pub fn get_messages(
        &self,
        channel_id: ChannelId,
        after: MessageId,
        limit: Option<i64>,
        offset: i64,
        order: Order,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, channel_id, after, limit.unwrap_or(-1), offset, order))
    }

    pub fn get_all_messages(&self, channel_id: ChannelId) -> Result<Vec<MessageRow>> {
        self.get_messages(channel_id, MessageId::ZERO, None, 0, Order::Ascending)
    }

    pub fn count_messages(&self, channel_id: ChannelId) -> Result<i64> {
        self.with_conn(|conn| {
            let cnt = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id.get()],
                |row| row.get(0),
            )?;
            Ok(cnt)
        })
    }

    pub fn count_messages_after(&self, channel_id: ChannelId, after: MessageId) -> Result<i64> {
        self.with_conn(|conn| {
            let cnt = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1 AND id > ?2",
                [channel_id.get(), after.get()],
                |row| row.get(0),
            )?;
            Ok(cnt)
        })
    }

    /// Highest id in the channel, or zero for an empty channel.
    pub fn max_message_id(&self, channel_id: ChannelId) -> Result<MessageId> {
        self.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(id), 0) FROM messages WHERE channel_id = ?1",
                [channel_id.get()],
                |row| row.get(0),
            )?;
            Ok(MessageId(max))
        })
    }

    // -- Read positions --

    pub fn get_read_position(&self, user_id: UserId, channel_id: ChannelId) -> Result<MessageId> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT message_id FROM haveread WHERE user_id = ?1 AND channel_id = ?2",
                    [user_id.get(), channel_id.get()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(MessageId(id.unwrap_or(0)))
        })
    }

    /// Upsert a read position. An existing row is only ever moved forward.
    pub fn upsert_read_position(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO haveread (user_id, channel_id, message_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, channel_id) DO UPDATE SET
                    message_id = MAX(message_id, excluded.message_id),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                [user_id.get(), channel_id.get(), message_id.get()],
            )?;
            Ok(())
        })
    }

    pub fn list_read_positions(&self) -> Result<Vec<ReadPositionRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id, channel_id, message_id FROM haveread ORDER BY user_id, channel_id")?;
            let rows = stmt
                .query_map([], read_position_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_read_positions_for_user(&self, user_id: UserId) -> Result<Vec<ReadPositionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, channel_id, message_id FROM haveread WHERE user_id = ?1 ORDER BY channel_id",
            )?;
            let rows = stmt
                .query_map([user_id.get()], read_position_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn read_position_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadPositionRow> {
    Ok(ReadPositionRow {
        user_id: row.get(0)?,
        channel_id: row.get(1)?,
        message_id: row.get(2)?,
    })
}

fn query_messages(
    conn: &Connection,
    channel_id: ChannelId,
    after: MessageId,
    limit: i64,
    offset: i64,
    order: Order,
) -> Result<Vec<MessageRow>> {
    let direction = if order.is_descending() { "DESC" } else { "ASC" };
    // JOIN users so every row carries its author display fields
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         JOIN users u ON m.user_id = u.id
         WHERE m.channel_id = ?1 AND m.id > ?2
         ORDER BY m.id {direction}
         LIMIT ?3 OFFSET ?4"
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(
            rusqlite::params![channel_id.get(), after.get(), limit, offset],
            |row| {
                Ok(MessageRow {
                    channel_id: row.get(0)?,
                    id: row.get(1)?,
                    user_id: row.get(2)?,
                    user_name: row.get(3)?,
                    display_name: row.get(4)?,
                    avatar_icon: row.get(5)?,
                    content: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("murmur.db")).unwrap();
        (dir, db)
    }

    fn seed(db: &Database) -> (ChannelId, UserId) {
        let user = db.create_user("alice", "Alice", "alice.png").unwrap();
        let channel = db.create_channel("general", "").unwrap();
        (channel, user)
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let (_dir, db) = open_temp();
        let (ch, user) = seed(&db);
        let now = Utc::now();

        assert!(db.insert_message(ch, MessageId(1), user, "first", &now).unwrap());
        assert!(!db.insert_message(ch, MessageId(1), user, "again", &now).unwrap());
        assert_eq!(db.count_messages(ch).unwrap(), 1);
    }

    #[test]
    fn next_id_continues_after_the_maximum() {
        let (_dir, db) = open_temp();
        let (ch, user) = seed(&db);
        let now = Utc::now();

        assert_eq!(db.insert_message_next(ch, user, "a", &now).unwrap(), MessageId(1));
        db.insert_message(ch, MessageId(5), user, "b", &now).unwrap();
        assert_eq!(db.insert_message_next(ch, user, "c", &now).unwrap(), MessageId(6));
        assert_eq!(db.max_message_id(ch).unwrap(), MessageId(6));
    }

    #[test]
    fn message_ids_are_scoped_per_channel() {
        let (_dir, db) = open_temp();
        let (ch1, user) = seed(&db);
        let ch2 = db.create_channel("random", "").unwrap();
        let now = Utc::now();

        db.insert_message(ch1, MessageId(1), user, "one", &now).unwrap();
        assert!(db.insert_message(ch2, MessageId(1), user, "uno", &now).unwrap());
        assert_eq!(db.max_message_id(ch2).unwrap(), MessageId(1));
        assert_eq!(db.list_channel_ids().unwrap(), vec![ch1, ch2]);
    }

    #[test]
    fn get_messages_is_exclusive_of_after_and_paginates() {
        let (_dir, db) = open_temp();
        let (ch, user) = seed(&db);
        let now = Utc::now();
        for i in 1..=5 {
            db.insert_message(ch, MessageId(i), user, &format!("m{}", i), &now).unwrap();
        }

        let ids = |rows: Vec<MessageRow>| rows.into_iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(db.get_messages(ch, MessageId(2), None, 0, Order::Ascending).unwrap()), vec![3, 4, 5]);
        assert_eq!(ids(db.get_messages(ch, MessageId::ZERO, Some(2), 1, Order::Descending).unwrap()), vec![4, 3]);
        assert!(db.get_messages(ch, MessageId(5), None, 0, Order::Ascending).unwrap().is_empty());
        assert_eq!(db.count_messages_after(ch, MessageId(3)).unwrap(), 2);

        let msg = db.get_all_messages(ch).unwrap().remove(0).into_message().unwrap();
        assert_eq!(msg.author.display_name, "Alice");
        assert_eq!(msg.created_at, now.trunc_subsecs(6));
    }

    #[test]
    fn read_position_never_moves_backwards() {
        let (_dir, db) = open_temp();
        let (ch, user) = seed(&db);

        assert_eq!(db.get_read_position(user, ch).unwrap(), MessageId::ZERO);
        db.upsert_read_position(user, ch, MessageId(5)).unwrap();
        db.upsert_read_position(user, ch, MessageId(3)).unwrap();
        assert_eq!(db.get_read_position(user, ch).unwrap(), MessageId(5));
        assert_eq!(db.list_read_positions().unwrap().len(), 1);
        assert_eq!(db.list_read_positions_for_user(user).unwrap()[0].message_id, 5);
        assert!(db.list_read_positions_for_user(UserId(999)).unwrap().is_empty());
    }

    #[test]
    fn profile_updates_show_up_on_authors() {
        let (_dir, db) = open_temp();
        let (_, user) = seed(&db);

        assert!(db.update_profile(user, "Alice A.", "new.png").unwrap());
        assert!(!db.update_profile(UserId(999), "Nobody", "x.png").unwrap());
        let author = db.get_author(user).unwrap().unwrap();
        assert_eq!(author.display_name, "Alice A.");
        assert_eq!(author.avatar_icon, "new.png");
    }
}
