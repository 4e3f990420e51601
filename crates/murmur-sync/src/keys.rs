use murmur_types::{ChannelId, UserId};

/// Cache key layout. Every key has exactly one container kind:
///
/// | key                                 | kind        |
/// |-------------------------------------|-------------|
/// | `{prefix}:channel:{id}:messages`    | ordered set |
/// | `{prefix}:channel:{id}:count`       | scalar      |
/// | `{prefix}:channel:{id}:seq`         | scalar      |
/// | `{prefix}:user:{id}:haveread`       | ordered set |
/// | `{prefix}:authors`                  | hash        |
/// | `{prefix}:channels`                 | set         |
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn messages(&self, channel: ChannelId) -> String {
        format!("{}:channel:{}:messages", self.prefix, channel)
    }

    pub fn count(&self, channel: ChannelId) -> String {
        format!("{}:channel:{}:count", self.prefix, channel)
    }

    pub fn sequence(&self, channel: ChannelId) -> String {
        format!("{}:channel:{}:seq", self.prefix, channel)
    }

    pub fn have_read(&self, user: UserId) -> String {
        format!("{}:user:{}:haveread", self.prefix, user)
    }

    pub fn authors(&self) -> String {
        format!("{}:authors", self.prefix)
    }

    pub fn channels(&self) -> String {
        format!("{}:channels", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = Keys::new("chat");
        assert_eq!(keys.messages(ChannelId(3)), "chat:channel:3:messages");
        assert_eq!(keys.count(ChannelId(3)), "chat:channel:3:count");
        assert_eq!(keys.sequence(ChannelId(3)), "chat:channel:3:seq");
        assert_eq!(keys.have_read(UserId(9)), "chat:user:9:haveread");
        assert_eq!(keys.channels(), "chat:channels");
    }
}
