//! Author display fields, cached in one hash keyed by user id.

use std::sync::Arc;

use murmur_types::{Author, UserId};
use tracing::warn;

use crate::Context;
use crate::codec::CacheRecord;
use crate::error::{SyncError, SyncResult};

pub struct AuthorCache {
    ctx: Arc<Context>,
}

impl AuthorCache {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn get(&self, user: UserId) -> SyncResult<Author> {
        let key = self.ctx.keys.authors();
        let field = user.to_string();

        match self.ctx.store.get_field(&key, &field) {
            Ok(Some(raw)) => match Author::decode(&raw) {
                Ok(author) => return Ok(author),
                Err(e) => {
                    warn!(user = %user, "dropping cached author: {}", e);
                    if let Err(e) = self.ctx.store.delete_field(&key, &field) {
                        warn!(user = %user, "could not drop corrupt author: {}", e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(user = %user, "author cache unavailable, reading database: {}", e);
                return self.load(user);
            }
        }

        let author = self.load(user)?;
        if let Err(e) = author
            .encode()
            .and_then(|raw| Ok(self.ctx.store.set_field(&key, &field, &raw)?))
        {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(user = %user, "could not cache author: {}", e);
        }
        Ok(author)
    }

    /// Forget a user's cached display fields after they change.
    pub fn invalidate(&self, user: UserId) -> SyncResult<()> {
        self.ctx.store.delete_field(&self.ctx.keys.authors(), &user.to_string())?;
        Ok(())
    }

    fn load(&self, user: UserId) -> SyncResult<Author> {
        self.ctx.db.get_author(user)?.ok_or(SyncError::UnknownAuthor(user))
    }
}
