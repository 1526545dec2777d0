use common::domain::{DomainError, DomainResult};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::str::FromStr;

/// Query topic keyword selecting every device
pub const ALL_DEVICES: &str = "all";

/// Characters escaped when a name is placed back into a topic segment
const NAME_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMethod {
    Get,
    Set,
}

impl CommandMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandMethod::Get => "get",
            CommandMethod::Set => "set",
        }
    }
}

impl fmt::Display for CommandMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("get") {
            Ok(CommandMethod::Get)
        } else if s.eq_ignore_ascii_case("set") {
            Ok(CommandMethod::Set)
        } else {
            Err(DomainError::UnsupportedMethod(s.to_string()))
        }
    }
}

/// Addressing carried by a device-command topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommandTopic {
    pub device_name: String,
    /// Already un-escaped
    pub command_name: String,
    pub method: CommandMethod,
}

impl DeviceCommandTopic {
    /// Command name escaped for use as a topic segment
    pub fn escaped_command_name(&self) -> String {
        escape_segment(&self.command_name)
    }
}

/// Target of a command-query topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    AllDevices,
    Device(String),
}

/// The raw `<device>/<command>/<method>` segments ending a device-command topic.
///
/// At least three segments must follow the first `prefix_len` segments.
pub fn trailing_command_segments(topic: &str, prefix_len: usize) -> DomainResult<[&str; 3]> {
    let segments: Vec<&str> = topic.split('/').collect();
    let remaining = segments.len().saturating_sub(prefix_len);
    if remaining < 3 {
        return Err(DomainError::TopicScheme(format!(
            "topic '{}' must end with '<device-name>/<command-name>/<method>' after {} prefix segments",
            topic, prefix_len
        )));
    }

    let n = segments.len();
    Ok([segments[n - 3], segments[n - 2], segments[n - 1]])
}

/// Parse `<prefix...>/<device>/<command>/<method>`.
///
/// Segments between the prefix and the last three (such as a device service
/// name) are ignored. The command name is percent-unescaped.
pub fn parse_device_command_topic(topic: &str, prefix_len: usize) -> DomainResult<DeviceCommandTopic> {
    let [device_name, command_name, method] = trailing_command_segments(topic, prefix_len)?;

    let command_name = unescape_segment(command_name).map_err(|e| {
        DomainError::TopicScheme(format!(
            "failed to unescape command name '{}': {}",
            command_name, e
        ))
    })?;

    Ok(DeviceCommandTopic {
        device_name: device_name.to_string(),
        command_name,
        method: method.parse()?,
    })
}

/// Parse the last segment of a command-query topic
pub fn parse_query_topic(topic: &str) -> QueryTarget {
    let last = topic.rsplit('/').next().unwrap_or_default();
    if last.eq_ignore_ascii_case(ALL_DEVICES) {
        QueryTarget::AllDevices
    } else {
        QueryTarget::Device(last.to_string())
    }
}

pub fn escape_segment(value: &str) -> String {
    utf8_percent_encode(value, NAME_SEGMENT).to_string()
}

/// Strict percent-unescape: every '%' must start a two digit hex escape and the
/// result must be UTF-8.
pub fn unescape_segment(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    for (i, _) in value.match_indices('%') {
        let valid = bytes
            .get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            return Err(format!("invalid escape at byte {}", i));
        }
    }

    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| e.to_string())
}
