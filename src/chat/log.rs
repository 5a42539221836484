use super::message::ApplicationMessage;

/// Append-only record of received messages, in arrival order.
///
/// Never reorders, deduplicates or evicts; it lives as long as the
/// client session that owns it.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<ApplicationMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: ApplicationMessage) {
        self.entries.push(message);
    }

    /// Read-only view of the current contents.
    pub fn snapshot(&self) -> &[ApplicationMessage] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> ApplicationMessage {
        ApplicationMessage {
            content: content.to_string(),
            timestamp: None,
            kind: None,
            pod_name: None,
            sender: None,
            client_count: None,
        }
    }

    #[test]
    fn test_starts_empty() {
        let log = MessageLog::new();
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn test_preserves_arrival_order() {
        let mut log = MessageLog::new();
        for content in ["first", "second", "third"] {
            log.append(msg(content));
        }
        let contents: Vec<&str> = log.snapshot().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_keeps_duplicates() {
        let mut log = MessageLog::new();
        log.append(msg("same"));
        log.append(msg("same"));
        assert_eq!(log.snapshot().len(), 2);
    }
}
