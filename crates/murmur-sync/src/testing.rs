use std::sync::Arc;

use chrono::Utc;
use murmur_cache::{CacheStore, MemoryStore};
use murmur_db::Database;
use murmur_types::{ChannelId, MessageId, UserId};
use tempfile::TempDir;

use crate::repair::{self, RepairJob, RepairQueue, Repairer};
use crate::{Context, Keys, SyncConfig, SyncResult};

pub(crate) struct Fixture {
    pub _dir: TempDir,
    pub db: Arc<Database>,
    pub store: Arc<MemoryStore>,
    pub ctx: Arc<Context>,
    pub queue: RepairQueue,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("murmur.db")).unwrap());
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig::default();
        let (repairs, queue) = repair::queue();
        let ctx = Arc::new(Context {
            store: store.clone() as Arc<dyn CacheStore>,
            db: db.clone(),
            keys: Keys::new(config.key_prefix.clone()),
            config,
            repairs,
        });
        Self {
            _dir: dir,
            db,
            store,
            ctx,
            queue,
        }
    }

    pub fn seed(&self) -> (ChannelId, UserId) {
        let user = self.db.create_user("alice", "Alice", "alice.png").unwrap();
        let channel = self.db.create_channel("general", "").unwrap();
        (channel, user)
    }

    pub fn insert(&self, channel: ChannelId, id: i64, user: UserId, content: &str) {
        assert!(self.db.insert_message(channel, MessageId(id), user, content, &Utc::now()).unwrap());
    }
}

#[derive(Default)]
struct Recorder(std::sync::Mutex<Vec<RepairJob>>);

impl Repairer for Recorder {
    fn repair(&self, job: RepairJob) -> SyncResult<()> {
        self.0.lock().unwrap().push(job);
        Ok(())
    }
}

impl Fixture {
    /// Drain the repair queue without running anything.
    pub fn take_repairs(&self) -> Vec<RepairJob> {
        let recorder = Recorder::default();
        self.queue.drain(&recorder);
        recorder.0.into_inner().unwrap()
    }
}
