/// Suffix of inbound command topics.
pub const SET_SUFFIX: &str = "set";

/// Suffix of per-path write status topics.
pub const STATUS_SUFFIX: &str = "status";

/// Suffix of per-path write error topics.
pub const ERROR_SUFFIX: &str = "error";

/// Builder for the bridge's MQTT topic namespace.
///
/// Topics follow the pattern `<prefix>/<path>[/<suffix>]`, plus the
/// availability topic `<prefix>/meta/availability`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    /// Create a builder for the given prefix. Leading and trailing slashes are dropped.
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    /// The normalized prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// State topic carrying the current value of a path.
    ///
    /// # Example
    /// ```
    /// use uamqtt_common::topics::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("plant/opcua/");
    /// assert_eq!(topics.value("zone1/temp"), "plant/opcua/zone1/temp");
    /// ```
    pub fn value(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }

    /// Command topic for writes to a path.
    pub fn set(&self, path: &str) -> String {
        format!("{}/{}/{}", self.prefix, path, SET_SUFFIX)
    }

    /// Status topic receiving "ok" after a successful write.
    pub fn status(&self, path: &str) -> String {
        format!("{}/{}/{}", self.prefix, path, STATUS_SUFFIX)
    }

    /// Error topic receiving write failure text.
    pub fn error(&self, path: &str) -> String {
        format!("{}/{}/{}", self.prefix, path, ERROR_SUFFIX)
    }

    /// Retained availability topic.
    ///
    /// # Example
    /// ```
    /// use uamqtt_common::topics::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("opcua");
    /// assert_eq!(topics.availability(), "opcua/meta/availability");
    /// ```
    pub fn availability(&self) -> String {
        format!("{}/meta/availability", self.prefix)
    }

    /// Wildcard subscription covering every topic under the prefix.
    pub fn wildcard(&self) -> String {
        format!("{}/#", self.prefix)
    }

    /// Extract the path from a command topic (`<prefix>/<path>/set`).
    ///
    /// Returns `None` for topics outside the prefix, topics without the
    /// `/set` suffix, and commands with an empty path.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let path = rest.strip_suffix(SET_SUFFIX)?.strip_suffix('/')?;

        if path.is_empty() { None } else { Some(path) }
    }
}
