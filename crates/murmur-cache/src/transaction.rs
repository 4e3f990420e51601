/// A command queued inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    Increment { key: String },
    AddWithScore { key: String, score: i64, member: Vec<u8> },
    RaiseScore { key: String, score: i64, member: Vec<u8> },
    SetField { key: String, field: String, value: Vec<u8> },
    AddMember { key: String, member: Vec<u8> },
    /// Read an ordered set's size at this point of the batch.
    Cardinality { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::Delete { key }
            | Command::Increment { key }
            | Command::AddWithScore { key, .. }
            | Command::RaiseScore { key, .. }
            | Command::SetField { key, .. }
            | Command::AddMember { key, .. }
            | Command::Cardinality { key } => key,
        }
    }
}

/// Per-command result of a committed transaction, in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Status reply (`SET`).
    Done,
    /// Integer reply: new counter value, number of keys removed or entries added.
    Integer(i64),
}

impl Reply {
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(n),
            Reply::Done => None,
        }
    }
}

/// A batch of commands applied atomically by [`CacheStore::commit`].
///
/// Commands are queued locally and sent as one `MULTI`/`EXEC` unit, so no other
/// client's command runs in between. A read queued in the batch (such as
/// [`Transaction::cardinality`]) observes the effect of the writes before it.
///
/// [`CacheStore::commit`]: crate::CacheStore::commit
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.commands.push(Command::Set { key: key.into(), value: value.into() });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Delete { key: key.into() });
        self
    }

    pub fn increment(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Increment { key: key.into() });
        self
    }

    pub fn add_with_score(
        &mut self,
        key: impl Into<String>,
        score: i64,
        member: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.commands.push(Command::AddWithScore {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    /// Queued form of [`CacheStore::raise_score`](crate::CacheStore::raise_score).
    pub fn raise_score(
        &mut self,
        key: impl Into<String>,
        score: i64,
        member: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.commands.push(Command::RaiseScore {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn set_field(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.commands.push(Command::SetField {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn add_member(&mut self, key: impl Into<String>, member: impl Into<Vec<u8>>) -> &mut Self {
        self.commands.push(Command::AddMember { key: key.into(), member: member.into() });
        self
    }

    pub fn cardinality(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Cardinality { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
