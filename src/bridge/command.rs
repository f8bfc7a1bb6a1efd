//! Device commands and their MQTT mapping

use std::fmt;

use bytes::Bytes;

/// A request for the device, relayed from HTTP to MQTT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PowerOn,
    PowerOff,
    PowerToggle,
    RequestStatus,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::PowerOn,
        Command::PowerOff,
        Command::PowerToggle,
        Command::RequestStatus,
    ];

    /// Metric label and log name
    pub fn label(self) -> &'static str {
        match self {
            Command::PowerOn => "power_on",
            Command::PowerOff => "power_off",
            Command::PowerToggle => "power_toggle",
            Command::RequestStatus => "request_status",
        }
    }

    /// Topic the command is published on for `device`
    pub fn topic(self, device: &str) -> String {
        match self {
            Command::PowerOn | Command::PowerOff | Command::PowerToggle => {
                format!("cmnd/{}/Power", device)
            }
            Command::RequestStatus => format!("cmnd/{}/Status0", device),
        }
    }

    pub fn payload(self) -> Bytes {
        match self {
            Command::PowerOn => Bytes::from_static(b"ON"),
            Command::PowerOff => Bytes::from_static(b"OFF"),
            Command::PowerToggle => Bytes::from_static(b"TOGGLE"),
            Command::RequestStatus => Bytes::new(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(Command::PowerOn, "cmnd/main/Power", b"ON" ; "power on")]
    #[test_case(Command::PowerOff, "cmnd/main/Power", b"OFF" ; "power off")]
    #[test_case(Command::PowerToggle, "cmnd/main/Power", b"TOGGLE" ; "power toggle")]
    #[test_case(Command::RequestStatus, "cmnd/main/Status0", b"" ; "request status")]
    fn test_mapping(command: Command, topic: &str, payload: &[u8]) {
        assert_eq!(command.topic("main"), topic);
        assert_eq!(&command.payload()[..], payload);
    }

    #[test]
    fn test_device_topic_is_substituted() {
        assert_eq!(Command::PowerOn.topic("kitchen"), "cmnd/kitchen/Power");
    }

    #[test]
    fn test_labels_are_distinct() {
        let mut labels: Vec<_> = Command::ALL.iter().map(|c| c.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), Command::ALL.len());
    }
}
