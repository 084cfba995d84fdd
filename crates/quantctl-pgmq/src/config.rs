/// Notify-channel configuration shared by [`crate::PgmqClient`] and
/// [`crate::listener::PgmqNotifyListener`].
///
/// `queue_naming_pattern` documents the convention used to derive a
/// namespace from a queue name (see [`crate::PgmqClient::extract_namespace`])
/// but is not itself compiled to a regex here — the client owns the actual
/// pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmqNotifyConfig {
    pub enable_triggers: bool,
    pub channel_prefix: String,
    pub queue_naming_pattern: String,
    pub default_namespaces: Vec<String>,
}

impl Default for PgmqNotifyConfig {
    fn default() -> Self {
        Self {
            enable_triggers: false,
            channel_prefix: "pgmq_events".to_string(),
            queue_naming_pattern: r"(?P<namespace>\w+)_queue".to_string(),
            default_namespaces: Vec::new(),
        }
    }
}

impl PgmqNotifyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_triggers_enabled(mut self, enabled: bool) -> Self {
        self.enable_triggers = enabled;
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Accumulates: repeated calls add further namespaces rather than
    /// replacing the list.
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespaces.push(namespace.into());
        self
    }

    pub(crate) fn channel_for(&self, queue: &str) -> String {
        format!("{}_{}", self.channel_prefix, queue)
    }
}
